//! `log` backend for the VM layer.
//!
//! The kernel registers where text goes (serial, video memory) once at boot;
//! until then records are dropped.

use alloc::boxed::Box;
use core::fmt;
use crate::config::VmConfig;
use log::{Level, Log, Metadata, Record};
use once_cell::race::OnceBox;

/// Where formatted log lines are written.
pub type LogSink = fn(fmt::Arguments);

struct KernelLogger {
    sink: OnceBox<LogSink>,
}

static LOGGER: KernelLogger = KernelLogger {
    sink: OnceBox::new(),
};

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(sink) = self.sink.get() else {
            return;
        };

        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        sink(format_args!("[{:>5}] {}: {}", tag, record.target(), record.args()));
    }

    fn flush(&self) {}
}

/// Installs the VM logger as the global `log` backend, filtering at
/// `config.log_level`.
///
/// Returns `false` if another logger was installed first; the level is still
/// applied in that case.
pub fn init(config: &VmConfig, sink: LogSink) -> bool {
    let _ = LOGGER.sink.set(Box::new(sink));
    let installed = log::set_logger(&LOGGER).is_ok();
    log::set_max_level(config.log_level);
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::{String, ToString};
    use log::LevelFilter;
    use std::sync::Mutex;

    static LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn capture(args: fmt::Arguments) {
        LINES.lock().unwrap().push(args.to_string());
    }

    #[test]
    fn records_reach_sink_with_level_tag() {
        let config = VmConfig::from_cmdline("vm.log=debug").unwrap();
        assert!(init(&config, capture));
        log::debug!(target: "vm", "frame {} evicted", 3);
        log::trace!(target: "vm", "below the level");

        let lines = LINES.lock().unwrap();
        assert!(lines.iter().any(|line| line == "[DEBUG] vm: frame 3 evicted"));
        assert!(!lines.iter().any(|line| line.contains("below the level")));
        drop(lines);

        // Only the first logger is installed.
        assert!(!init(&config, capture));
        assert_eq!(log::max_level(), LevelFilter::Debug);
    }
}
