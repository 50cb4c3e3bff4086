use std::io::Write;

use chrono::Local;
use log::LevelFilter;

/// Installs the process-wide logger. `RUST_LOG` overrides `default_level`.
///
/// Calling it twice is harmless; the second call leaves the first logger in place.
pub fn init(default_level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(default_level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        });

    if builder.try_init().is_ok() {
        log::info!("Logging initialized at {}", default_level);
    }
}
