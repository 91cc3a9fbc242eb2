//! Minimal stderr logger for tests and demo code.
//!
//! The crate itself only talks to the `log` facade; embedding processes are
//! expected to install their own sink. This one exists so the scheduler's
//! tracing is visible without pulling a logging framework into dev builds.

/// Dummy type to help us implement a logger using the `log` crate.
struct Logger;

static LOGGER: Logger = Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{level}] {target}: {args}",
                level = record.level(),
                target = record.target(),
                args = record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the stderr logger at `Info`. Idempotent: if a logger is already
/// installed (by this function or by the embedding process), does nothing.
pub fn init() {
    init_with_level(log::LevelFilter::Info);
}

pub fn init_with_level(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_with_level(log::LevelFilter::Warn);
        // A second installation attempt must not panic or change the level.
        init();
        assert_eq!(log::max_level(), log::LevelFilter::Warn);
        log::warn!("logger installed");
    }
}
