use std::{io::Write, path::Path};

use env_logger::{Builder, Env};

/// Configure the logging format and install the global logger. The log
/// level is processed here as well, i.e. `RUST_LOG=nvmf_fc=trace` prints
/// all trace!() and higher messages to the console.
pub fn init(level: &str) {
    let mut builder =
        Builder::from_env(Env::default().default_filter_or(level));

    builder.format(|buf, record| {
        let mut level_style = buf.default_level_style(record.level());
        level_style.set_intense(true);
        writeln!(
            buf,
            "[{} {} {}:{}] {}",
            buf.timestamp_nanos(),
            level_style.value(record.level()),
            Path::new(record.file().unwrap_or("<unknown>"))
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("<unknown>"),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    // tests may install the logger more than once
    builder.try_init().ok();
}
