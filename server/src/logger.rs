// SPDX-License-Identifier: MPL-2.0

//! The console logger.

use log::{LevelFilter, Metadata, Record};

use crate::clock;

/// The logger used for metadir.
struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let millis = clock::current_time_millis();
        let (secs, sub_millis) = (millis / 1000, millis % 1000);
        eprintln!(
            "[{:>5}] {}.{:03} {}: {}",
            record.level(),
            secs,
            sub_millis,
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Installs the console logger with the given max level.
///
/// A second call (tests start several servers in one process) is a no-op.
pub fn init(max_level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}
