use std::fs;
use std::process::ExitCode;
use std::sync::Mutex;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    init_logging();

    info!("Starting slatewm");

    let mut wm = match slatewm::wm::Wm::initialize(None) {
        Ok(wm) => wm,
        Err(err) => {
            error!("Failed to initialize window manager: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    wm.run();
    wm.teardown();

    info!("slatewm exited cleanly");
    ExitCode::SUCCESS
}

/// Console logging filtered by `RUST_LOG`, plus a plain-text log file at
/// `~/.config/slatewm/slatewm.log`. An unwritable log file is not fatal.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "slatewm=debug,info".into()),
    );

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match open_log_file() {
        Ok(file) => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        Err(err) => {
            registry.init();
            warn!(%err, "file logging disabled");
        }
    }
}

fn open_log_file() -> std::io::Result<fs::File> {
    let dir = dirs::config_dir()
        .ok_or_else(|| std::io::Error::other("no config directory"))?
        .join("slatewm");
    fs::create_dir_all(&dir)?;
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("slatewm.log"))
}
