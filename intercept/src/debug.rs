//! `log` backend printing to fd 2 through the no-intercept primitive.
//!
//! The dispatcher runs at roughly signal-handler level: no allocation, no
//! libc stdio. Lines longer than the stack buffer are truncated.

use std::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};
use syscalls::Sysno;

use crate::util::{sys_no_intercept, FixedBuf};

struct DumpLogger;

static LOGGER: DumpLogger = DumpLogger;

impl Log for DumpLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut buf: FixedBuf<0x400> = FixedBuf::new();
        let _ = writeln!(buf, "intercept: {}", record.args());
        let bytes = buf.as_bytes();
        sys_no_intercept(
            Sysno::write,
            [2, bytes.as_ptr() as i64, bytes.len() as i64, 0, 0, 0],
        );
    }

    fn flush(&self) {}
}

/// Wire up the logger; debug dumps stay off unless INTERCEPT_DEBUG_DUMP
/// asked for them.
pub fn init(debug_dumps_on: bool) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(if debug_dumps_on {
        LevelFilter::Debug
    } else {
        LevelFilter::Off
    });
}
