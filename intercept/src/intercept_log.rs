//! The raw syscall log: append-only text, one line per event, written with
//! the no-intercept primitive only.

use std::ffi::{CStr, CString, OsStr};
use std::fmt::Write;
use std::sync::atomic::{AtomicI32, Ordering};

use syscalls::Sysno;

use crate::dispatch::SyscallDesc;
use crate::util::{sys_no_intercept, syscall_error_code, xabort_errno, FixedBuf};

static LOG_FD: AtomicI32 = AtomicI32::new(-1);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LogOutcome {
    /// logged before the call is decided; the result column is a "?"
    Unknown,
    /// the call is done and the result is known
    Known,
}

/// Substitute "%p" in the log path template with the decimal pid, so
/// concurrent processes do not interleave one file.
fn expand_template(template: &str, pid: i64) -> String {
    template.replace("%p", &pid.to_string())
}

/// Open the log file named by the INTERCEPT_LOG template. Nothing is ever
/// logged when the variable is absent.
pub fn setup_log(template: Option<&OsStr>, truncate: bool) {
    let template = match template.and_then(|t| t.to_str()) {
        Some(t) if !t.is_empty() => t,
        _ => return,
    };

    let pid = sys_no_intercept(Sysno::getpid, [0; 6]);
    let path = expand_template(template, pid);
    let path = match CString::new(path) {
        Ok(p) => p,
        Err(_) => return,
    };

    let mut flags = libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND;
    if truncate {
        flags |= libc::O_TRUNC;
    }

    let fd = sys_no_intercept(
        Sysno::openat,
        [
            libc::AT_FDCWD as i64,
            path.as_ptr() as i64,
            flags as i64,
            0o700,
            0,
            0,
        ],
    );
    if syscall_error_code(fd) != 0 {
        xabort_errno(syscall_error_code(fd), "opening log");
    }

    LOG_FD.store(fd as i32, Ordering::Relaxed);
    log_header();
}

fn log_write(bytes: &[u8]) {
    let fd = LOG_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    sys_no_intercept(
        Sysno::write,
        [fd as i64, bytes.as_ptr() as i64, bytes.len() as i64, 0, 0, 0],
    );
}

/// A line making the log file its own decoder: running it through `sh`
/// resolves every `path offset` pair with addr2line.
fn log_header() {
    static SELF_DECODER: &str = concat!(
        "tempfile=$(mktemp) ; tempfile2=$(mktemp) ; ",
        "grep \"^/\" $0 | cut -d \" \" -f 1,2 | ",
        "sed \"s/^/addr2line -p -f -e /\" > $tempfile ; ",
        "{ echo ; . $tempfile ; echo ; } > $tempfile2 ; ",
        "paste $tempfile2 $0 ; exit 0\n"
    );
    log_write(SELF_DECODER.as_bytes());
}

pub fn log_line(line: &str) {
    let mut buf: FixedBuf<0x200> = FixedBuf::new();
    let _ = writeln!(buf, "{}", line);
    log_write(buf.as_bytes());
}

fn format_syscall_line<const N: usize>(
    buf: &mut FixedBuf<N>,
    path: &CStr,
    offset: usize,
    desc: &SyscallDesc,
    outcome: LogOutcome,
    result: i64,
) {
    let _ = write!(
        buf,
        "{} {:#x} -- syscall({}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}) = ",
        path.to_string_lossy(),
        offset,
        desc.nr,
        desc.args[0],
        desc.args[1],
        desc.args[2],
        desc.args[3],
        desc.args[4],
        desc.args[5],
    );
    match outcome {
        LogOutcome::Unknown => {
            let _ = writeln!(buf, "?");
        }
        LogOutcome::Known => {
            let _ = writeln!(buf, "{}", result);
        }
    }
}

pub fn log_syscall(
    path: &CStr,
    offset: usize,
    desc: &SyscallDesc,
    outcome: LogOutcome,
    result: i64,
) {
    if LOG_FD.load(Ordering::Relaxed) < 0 {
        return;
    }
    let mut buf: FixedBuf<0x200> = FixedBuf::new();
    format_syscall_line(&mut buf, path, offset, desc, outcome, result);
    log_write(buf.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expansion_inserts_the_pid() {
        assert_eq!(expand_template("/tmp/ic.%p", 1234), "/tmp/ic.1234");
        assert_eq!(expand_template("/tmp/ic.log", 1234), "/tmp/ic.log");
    }

    #[test]
    fn line_format_matches_the_decoder_expectations() {
        let desc = SyscallDesc {
            nr: 64,
            args: [1, 0x5000, 4, 0, 0, 0],
        };
        let path = CString::new("/usr/lib/libc.so.6").unwrap();

        let mut buf: FixedBuf<0x200> = FixedBuf::new();
        format_syscall_line(&mut buf, &path, 0x103f4, &desc, LogOutcome::Unknown, 0);
        assert_eq!(
            std::str::from_utf8(buf.as_bytes()).unwrap(),
            "/usr/lib/libc.so.6 0x103f4 -- syscall(64, 0x1, 0x5000, 0x4, 0x0, 0x0, 0x0) = ?\n"
        );

        let mut buf: FixedBuf<0x200> = FixedBuf::new();
        format_syscall_line(&mut buf, &path, 0x103f4, &desc, LogOutcome::Known, 4);
        assert!(std::str::from_utf8(buf.as_bytes()).unwrap().ends_with("= 4\n"));
    }
}
