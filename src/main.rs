use std::time::{Duration, Instant};

use blepoll::{BleEngine, EngineConfig, ScanStatus};

const SCAN_WINDOW: Duration = Duration::from_secs(15);

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Falling back to default configuration: {}", e);
            EngineConfig::default()
        }
    };

    let engine = match BleEngine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("Failed to start engine: {}", e);
            std::process::exit(1);
        }
    };

    // Scan with no service filter and print every advertisement for a
    // fixed window.
    engine.start_device_scan(&[]);
    let deadline = Instant::now() + SCAN_WINDOW;
    let mut seen = 0usize;
    while Instant::now() < deadline {
        match engine.poll_device(false) {
            ScanStatus::Available(device) => {
                seen += 1;
                let name = if device.name.is_empty() {
                    "(unnamed)"
                } else {
                    device.name.as_str()
                };
                println!("{}  {}", device.id, name);
            }
            ScanStatus::Processing => std::thread::sleep(Duration::from_millis(100)),
            ScanStatus::Finished => break,
        }
    }
    engine.stop_device_scan();

    // Drain whatever arrived between the last poll and the stop.
    while let ScanStatus::Available(device) = engine.poll_device(false) {
        seen += 1;
        println!("{}  (late)", device.id);
    }

    log::info!("Scan finished, {} advertisements", seen);
    engine.quit();
}
