use log::{LevelFilter, Log, Metadata, Record};

/// Level used when neither `-v` nor the variable is given.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Warn;
const LOG_ENV: &str = "PEBRIDGE_LOG";

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("{:<5} {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

pub fn init(verbose: u8) {
    let level = match verbose {
        0 => std::env::var(LOG_ENV)
            .ok()
            .and_then(|level| level.parse().ok())
            .unwrap_or(DEFAULT_LEVEL),
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
