use env_logger::{Builder, Env};
use log::info;
use std::io::Write;

// One line per record: time, level, source location, message. RUST_LOG overrides the debug default.
pub fn setup_logger() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("debug"));

    builder.format(|buf, record| {
        let level = buf.default_styled_level(record.level());
        writeln!(
            buf,
            "[{}] {} [{}:{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    });

    if builder.try_init().is_ok() {
        info!("Logger initialized");
    }
}
