//! The C side of the runtime dispatch: identify the patch that fired,
//! run the user hook, and tell the assembly entry how to finish the job.

use syscalls::Sysno;

use crate::consts::*;
use crate::hook;
use crate::intercept_log::{self, LogOutcome};
use crate::magic;
use crate::obj::ObjDesc;
use crate::patch::PatchDesc;
use crate::util::{syscall_no_intercept, xabort, WrapperRet};

#[derive(Clone, Copy, Debug)]
pub struct SyscallDesc {
    pub nr: i32,
    pub args: [i64; 6],
}

/// First patch whose return address matches. The return addresses are
/// unique by construction, so first match is the only match.
fn get_cur_patch(return_address: i64) -> Option<(&'static ObjDesc, &'static PatchDesc)> {
    for obj in crate::objects() {
        for patch in &obj.patches {
            if patch.return_address as i64 == return_address {
                return Some((obj, patch));
            }
        }
    }
    None
}

/// Called by the assembly entry right after a patch fired, with the three
/// possible return-key registers: `0(sp)` (MID), a7 (SML) and ra (GW).
/// Returns the class tag (or, for SML, the recorded syscall number) in a0
/// and the patch's relocation block in a1.
#[no_mangle]
pub extern "C" fn detect_cur_patch(mid_ret_addr: u64, sml_ret_addr: u64, gw_ret_addr: u64) -> WrapperRet {
    let candidates = [mid_ret_addr, sml_ret_addr, gw_ret_addr];

    for (slot, &ret_addr) in candidates.iter().enumerate() {
        for obj in crate::objects() {
            for patch in &obj.patches {
                if patch.return_address as u64 != ret_addr {
                    continue;
                }
                let consistent = match patch.syscall_num {
                    TYPE_GW => slot == 2,
                    TYPE_MID => slot == 0,
                    _ => slot == 1,
                };
                if consistent {
                    return WrapperRet {
                        a0: patch.syscall_num,
                        a1: patch.relocation_address as i64,
                    };
                }
            }
        }
    }

    xabort("failed to identify patch");
}

fn log_syscall(
    patch: Option<(&ObjDesc, &PatchDesc)>,
    desc: &SyscallDesc,
    outcome: LogOutcome,
    result: i64,
) {
    static UNKNOWN_PATH: &[u8] = b"?\0";
    let (path, offset) = match patch {
        Some((obj, p)) => (obj.path.as_c_str(), p.syscall_offset),
        None => (
            std::ffi::CStr::from_bytes_with_nul(UNKNOWN_PATH).unwrap(),
            0,
        ),
    };
    intercept_log::log_syscall(path, offset, desc, outcome, result);
}

#[repr(C)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

fn clone3_stack(args_ptr: i64) -> u64 {
    if args_ptr == 0 {
        return 0;
    }
    unsafe { (*(args_ptr as *const CloneArgs)).stack }
}

/// One hooked syscall. a6 carries the firing patch's return address, a7
/// the syscall number (recovered by `detect_cur_patch` for SML sites).
#[no_mangle]
pub extern "C" fn intercept_routine(
    a0: i64,
    a1: i64,
    a2: i64,
    a3: i64,
    a4: i64,
    a5: i64,
    a6: i64,
    a7: i64,
) -> WrapperRet {
    let mut result = WrapperRet { a0, a1 };
    let mut forward_to_kernel = true;
    let patch = get_cur_patch(a6);
    let desc = SyscallDesc {
        nr: a7 as i32,
        args: [a0, a1, a2, a3, a4, a5],
    };

    if magic::handle_magic_syscalls(&desc, &mut result.a0) == 0 {
        return result;
    }

    log_syscall(patch, &desc, LogOutcome::Unknown, 0);

    unsafe {
        if let Some(hook_fn) = hook::intercept_hook_point {
            forward_to_kernel = hook_fn(
                desc.nr as i64,
                desc.args[0],
                desc.args[1],
                desc.args[2],
                desc.args[3],
                desc.args[4],
                desc.args[5],
                &mut result.a0,
            ) != 0;
        }
    }

    if desc.nr == Sysno::rt_sigreturn as i32 {
        // cannot be finished from C, the entry transfers directly
        return WrapperRet {
            a0: UNH_SYSCALL,
            a1: UNH_GENERIC,
        };
    }

    if forward_to_kernel {
        // A clone with its own child stack (or a vfork) must issue the
        // ecall from the assembly entry: the child cannot return through
        // this frame. Stackless clones (fork) come back here in both
        // processes and take the normal path below.
        if desc.nr == Sysno::clone as i32
            && (desc.args[1] != 0 || desc.args[0] & i64::from(libc::CLONE_VFORK) != 0)
        {
            return WrapperRet {
                a0: UNH_SYSCALL,
                a1: UNH_CLONE,
            };
        } else if desc.nr == Sysno::clone3 as i32 && clone3_stack(desc.args[0]) != 0 {
            return WrapperRet {
                a0: UNH_SYSCALL,
                a1: UNH_CLONE,
            };
        } else {
            result = unsafe {
                syscall_no_intercept(
                    desc.nr as i64,
                    desc.args[0],
                    desc.args[1],
                    desc.args[2],
                    desc.args[3],
                    desc.args[4],
                    desc.args[5],
                )
            };
        }

        // offer the post-clone hooks for the shared-stack variants too, so
        // every clone flavor looks the same to the user
        if desc.nr == Sysno::clone as i32 || desc.nr == Sysno::clone3 as i32 {
            intercept_routine_post_clone(result.a0);
        }
    }

    log_syscall(patch, &desc, LogOutcome::Known, result.a0);

    result
}

/// Runs on both sides of a clone; zero means child.
#[no_mangle]
pub extern "C" fn intercept_routine_post_clone(a0: i64) {
    unsafe {
        if a0 == 0 {
            if let Some(f) = hook::intercept_hook_point_clone_child {
                f();
            }
        } else if let Some(f) = hook::intercept_hook_point_clone_parent {
            f(a0);
        }
    }
}

/// KNOWN-outcome logging for clones finished by the assembly entry; the
/// normal logging path's frame no longer exists at that point.
#[no_mangle]
pub extern "C" fn intercept_post_clone_log_syscall(
    a0: i64,
    a1: i64,
    a2: i64,
    a3: i64,
    a4: i64,
    a5: i64,
    a6: i64,
    a7: i64,
) {
    let patch = get_cur_patch(a6);
    let desc = SyscallDesc {
        nr: a7 as i32,
        args: [a0, a1, a2, a3, a4, a5],
    };
    log_syscall(patch, &desc, LogOutcome::Known, a0);
}
