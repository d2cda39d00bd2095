//! Tiny syscall intercepting example library, turning every lower case
//! letter 'i' into an upper case 'I' in buffers used in write syscalls.
//!
//! Build and preload together with the interceptor:
//!
//! ```sh
//! LD_PRELOAD=target/release/libicap.so ls
//! ```

use std::os::raw::c_int;

use syscall_intercept::{hook, syscall_no_intercept};
use syscalls::Sysno;

unsafe extern "C" fn icap_hook(
    syscall_number: i64,
    arg0: i64,
    arg1: i64,
    arg2: i64,
    _arg3: i64,
    _arg4: i64,
    _arg5: i64,
    result: *mut i64,
) -> c_int {
    if syscall_number != Sysno::write as i64 {
        // anything else is forwarded untouched
        return 1;
    }

    let mut buf_copy = [0u8; 0x1000];
    let size = (arg2 as usize).min(buf_copy.len());
    std::ptr::copy_nonoverlapping(arg1 as *const u8, buf_copy.as_mut_ptr(), size);

    for b in buf_copy[..size].iter_mut() {
        if *b == b'i' {
            *b = b'I';
        }
    }

    let ret = syscall_no_intercept(
        Sysno::write as i64,
        arg0,
        buf_copy.as_ptr() as i64,
        size as i64,
        0,
        0,
        0,
    );
    *result = ret.a0;
    0
}

#[link_section = ".init_array"]
#[used]
static ICAP_CTOR: extern "C" fn() = {
    extern "C" fn start() {
        unsafe {
            hook::intercept_hook_point = Some(icap_hook);
        }
    }
    start
};
