//! The process-global hook points, with the same symbol names and calling
//! convention the C header of the original library promised.

use std::ffi::CStr;
use std::os::raw::c_int;

/// Return 0 to suppress the kernel call and surface `*result` instead,
/// non-zero to forward the call unchanged.
pub type HookFn = unsafe extern "C" fn(
    syscall_number: i64,
    arg0: i64,
    arg1: i64,
    arg2: i64,
    arg3: i64,
    arg4: i64,
    arg5: i64,
    result: *mut i64,
) -> c_int;

#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut intercept_hook_point: Option<HookFn> = None;

#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut intercept_hook_point_clone_child: Option<unsafe extern "C" fn()> = None;

#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut intercept_hook_point_clone_parent: Option<unsafe extern "C" fn(i64)> = None;

/// INTERCEPT_HOOK_CMDLINE_FILTER: when set, only a process whose argv[0]
/// basename equals the value gets patched; everything else stays inert.
pub fn syscall_hook_in_process_allowed(cmdline: Option<&CStr>, filter: Option<&[u8]>) -> bool {
    let filter = match filter {
        Some(f) => f,
        None => return true,
    };
    let cmdline = match cmdline {
        Some(c) => c.to_bytes(),
        None => return false,
    };
    let base = match cmdline.iter().rposition(|&c| c == b'/') {
        Some(i) => &cmdline[i + 1..],
        None => cmdline,
    };
    base == filter
}
