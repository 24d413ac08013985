use flexi_logger::{DeferredNow, FileSpec, Logger, LoggerHandle, WriteMode};
use log::Record;
use std::io::Write;
use std::{env, thread};

/// Initializes the file logger with custom formatting.
///
/// The spec can be overridden through `VTABLE_PROBE_LOG` (standard
/// `module=level` syntax); the log file lands in a `logs` directory next to the
/// host process, which is usually the most convenient place to find it after a
/// session inside someone else's process.
pub fn init_logger() -> Result<LoggerHandle, Box<dyn std::error::Error>> {
    let spec = env::var("VTABLE_PROBE_LOG").unwrap_or_else(|_| "vtable_probe=info".into());
    let handle = Logger::try_with_str(spec)?
        .log_to_file(FileSpec::default().directory("logs").suppress_timestamp())
        .append()
        .write_mode(WriteMode::BufferAndFlush)
        .format(log_format)
        .start()?;
    Ok(handle)
}

/// Custom log line format: timestamp, level, source file/line, thread name, message.
fn log_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} [{:<5}] [{}:{}] [{}] {}",
        now.format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.file().unwrap_or("<unknown>"),
        record.line().unwrap_or(0),
        thread::current().name().unwrap_or("<unnamed>"),
        &record.args()
    )
}
