//! User space syscall interception for riscv64 linux.
//!
//! Loaded via LD_PRELOAD (or linked in), the library's constructor
//! disassembles the text of libc and libpthread, overwrites the bytes in
//! and around every ecall with a jump through a per-object trampoline into
//! a shared assembly entry, and from there forwards each syscall to the
//! `intercept_hook_point` the host process installed. The hook decides per
//! call whether the kernel is reached at all.
//!
//! Startup is all-or-nothing: either every selected site is patched, or
//! the process exits with a one line diagnostic. A partially patched libc
//! would intercept some call sites and miss others that look identical.

// most of the patching pipeline is riscv64-only; host builds only compile
// the architecture independent logic for the unit tests
#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;

pub mod consts;
pub mod disasm;
pub mod hook;

mod activate;
mod debug;
mod dispatch;
mod encode;
#[cfg(target_arch = "riscv64")]
mod entry;
mod intercept_log;
mod magic;
mod obj;
mod patch;
mod reloc;
mod scan;
mod util;

use std::ffi::OsString;

pub use magic::{MAGIC_ANSWER, MAGIC_CLOCK, MAGIC_PROBE, MAGIC_VERSION};
pub use util::{syscall_error_code, syscall_no_intercept, WrapperRet};

struct Config {
    debug_dumps_on: bool,
    patch_all_objs: bool,
    log_path: Option<OsString>,
    log_trunc: bool,
    cmdline_filter: Option<Vec<u8>>,
}

impl Config {
    fn from_env() -> Self {
        use std::os::unix::ffi::OsStringExt;
        Config {
            debug_dumps_on: std::env::var_os("INTERCEPT_DEBUG_DUMP").is_some(),
            patch_all_objs: std::env::var_os("INTERCEPT_ALL_OBJS").is_some(),
            log_path: std::env::var_os("INTERCEPT_LOG"),
            log_trunc: std::env::var_os("INTERCEPT_LOG_TRUNC").is_some(),
            cmdline_filter: std::env::var_os("INTERCEPT_HOOK_CMDLINE_FILTER")
                .map(|v| v.into_vec()),
        }
    }
}

lazy_static! {
    static ref CFG: Config = Config::from_env();
}

/// The frozen table of patched objects. Written once by the constructor,
/// before any second thread can exist, read lock-free ever after.
static mut OBJS: Vec<obj::ObjDesc> = Vec::new();

pub(crate) fn objects() -> &'static [obj::ObjDesc] {
    unsafe { (*std::ptr::addr_of!(OBJS)).as_slice() }
}

/// Identity keys must not collide: the dispatcher knows a patch only by
/// its return address.
fn check_return_addresses_unique(objs: &[obj::ObjDesc]) {
    let mut seen = std::collections::HashSet::new();
    for obj in objs {
        for patch in &obj.patches {
            if !seen.insert(patch.return_address) {
                util::xabort("return address collision between patches");
            }
        }
    }
}

/// The highest level of the hotpatching logic, run as a library
/// constructor before the host's main.
#[cfg(target_arch = "riscv64")]
unsafe fn intercept(argv: *const *const libc::c_char) {
    use std::ffi::CStr;

    let cmdline = if argv.is_null() || (*argv).is_null() {
        None
    } else {
        Some(CStr::from_ptr(*argv))
    };
    if !hook::syscall_hook_in_process_allowed(cmdline, CFG.cmdline_filter.as_deref()) {
        return;
    }

    debug::init(CFG.debug_dumps_on);
    intercept_log::setup_log(CFG.log_path.as_deref(), CFG.log_trunc);

    let rvc = cfg!(target_feature = "c");
    let entry_addr = entry::entry_point_addr();
    let self_addr = obj::object_base_of(reloc::relocation_space().0);

    let mut objs = obj::discover_objects(CFG.patch_all_objs, rvc, self_addr);

    reloc::init_tls_offset_table();
    reloc::write_enable_relocation_space(true);
    let mut writer = reloc::RelocWriter::new();
    for desc in objs.iter_mut() {
        if desc.patches.is_empty() {
            continue;
        }
        activate::allocate_trampoline(desc, entry_addr);
        let text = std::slice::from_raw_parts(
            desc.text_start as *const u8,
            desc.text_end - desc.text_start,
        );
        patch::create_patches(desc, text, &mut writer, rvc);
    }
    reloc::write_enable_relocation_space(false);

    check_return_addresses_unique(&objs);

    // publish before the first byte of text changes: the dispatcher needs
    // the table the moment a patch can fire
    *std::ptr::addr_of_mut!(OBJS) = objs;

    for desc in objects() {
        activate::activate_patches(desc, entry_addr, rvc);
    }
}

#[cfg(target_arch = "riscv64")]
#[link_section = ".init_array"]
#[used]
static INTERCEPT_CTOR: extern "C" fn(
    libc::c_int,
    *const *const libc::c_char,
    *const *const libc::c_char,
) = {
    extern "C" fn intercept_ctor(
        _argc: libc::c_int,
        argv: *const *const libc::c_char,
        _envp: *const *const libc::c_char,
    ) {
        unsafe { intercept(argv) }
    }
    intercept_ctor
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::InsnInfo;

    #[test]
    fn duplicate_return_addresses_would_be_a_bug() {
        use std::ffi::CString;
        let mk = |ret: usize| {
            let mut p = patch::PatchDesc::new(
                0,
                0,
                vec![InsnInfo::unset(); consts::SURROUNDING_INSTRS_NUM],
                -1,
            );
            p.return_address = ret;
            p
        };
        let mut o = obj::ObjDesc {
            base_addr: 0,
            path: CString::new("x").unwrap(),
            text_start: 0,
            text_end: 0,
            jump_targets: Default::default(),
            patches: vec![mk(0x1000), mk(0x2000)],
            trampoline_address: 0,
            uses_trampoline: false,
        };
        check_return_addresses_unique(std::slice::from_ref(&o));
        // the collision case aborts the process, so only the happy path
        // can be exercised here
        o.patches.push(mk(0x3000));
        check_return_addresses_unique(std::slice::from_ref(&o));
    }
}
