//! Deciding how to overwrite each ecall site.
//!
//! Every site gets one of three patch shapes, chosen by how many bytes of
//! surrounding code may safely be displaced into the relocation buffer:
//! a full gateway (`GW`) with a 2 GiB indirect jump, a `MID` patch whose
//! single jal borrows a nearby gateway, or a minimal `SML` jal when the
//! syscall number is statically known.

use std::collections::HashSet;

use log::debug;

use crate::consts::*;
use crate::disasm::InsnInfo;
use crate::obj::ObjDesc;
use crate::reloc::RelocWriter;
use crate::util::xabort;

pub struct PatchDesc {
    /// address of the ecall instruction
    pub syscall_addr: usize,
    /// offset of the ecall inside the object file, for logging
    pub syscall_offset: usize,
    /// disassembly window centred on the ecall; dropped after planning
    surrounding: Option<Vec<InsnInfo>>,
    /// index of the ecall inside the (trimmed) window
    pub syscall_idx: usize,
    /// statically recovered syscall number, later the class tag for GW/MID
    pub syscall_num: i64,
    /// register carrying the jump-back address, 0 when undecided
    pub return_register: u8,
    /// first overwritten byte; after gateway resolution this is the jal
    /// target for MID/SML patches
    pub dst_jmp_patch: usize,
    /// bytes overwritten, compressed nop padding included
    pub patch_size_bytes: usize,
    /// where the dispatcher re-enters the patched text; unique per patch
    /// and used at runtime as the patch's identity
    pub return_address: usize,
    /// where the displaced instructions live in the relocation buffer
    pub relocation_address: usize,
    pub is_ra_used_before: bool,
    pub is_ra_used_after: bool,
    pub start_with_c_nop: bool,
    pub end_with_c_nop: bool,
}

impl PatchDesc {
    pub fn new(
        syscall_addr: usize,
        syscall_offset: usize,
        window: Vec<InsnInfo>,
        syscall_num: i64,
    ) -> Self {
        debug_assert_eq!(window.len(), SURROUNDING_INSTRS_NUM);
        PatchDesc {
            syscall_addr,
            syscall_offset,
            surrounding: Some(window),
            syscall_idx: SYSCALL_IDX,
            syscall_num,
            return_register: 0,
            dst_jmp_patch: 0,
            patch_size_bytes: 0,
            return_address: 0,
            relocation_address: 0,
            is_ra_used_before: false,
            is_ra_used_after: false,
            start_with_c_nop: false,
            end_with_c_nop: false,
        }
    }

    pub fn window(&self) -> &[InsnInfo] {
        self.surrounding.as_deref().unwrap_or(&[])
    }

    pub fn window_mut(&mut self) -> &mut [InsnInfo] {
        self.surrounding.as_deref_mut().unwrap_or(&mut [])
    }

    fn drop_window(&mut self) {
        self.surrounding = None;
    }
}

fn is_copiable_before_syscall(ins: &InsnInfo) -> bool {
    if !ins.is_set {
        return false;
    }
    !(ins.has_ip_relative_opr || ins.is_abs_jump || ins.is_syscall || ins.modifies_stack)
}

/// Returns are permitted after the ecall, pc-relative operands are not.
fn is_copiable_after_syscall(ins: &InsnInfo) -> bool {
    if !ins.is_set {
        return false;
    }
    !(ins.has_ip_relative_opr || ins.is_syscall || ins.modifies_stack)
}

fn is_sml_patchable(patch: &PatchDesc, patchable_size: usize, rvc: bool) -> bool {
    if patch.syscall_num < 0 {
        // the kernel needs a number the patch cannot reload
        return false;
    }
    if patchable_size <= JAL_INS_SIZE {
        return false;
    }
    if patch.return_register != 0 {
        return true;
    }
    if rvc && patch.syscall_num < 32 {
        patchable_size >= JAL_INS_SIZE + C_LI_INS_SIZE
    } else {
        patchable_size >= JAL_INS_SIZE + ADDI_INS_SIZE
    }
}

/// A second ecall inside the window. Trim so the first one still gets a
/// viable, possibly smaller, patch.
fn check_two_ecalls(
    patch: &PatchDesc,
    window: &[InsnInfo],
    syscall_idx: usize,
    start_idx: usize,
    second_ecall_idx: usize,
    rvc: bool,
) -> usize {
    // when a7 is not known, force a MID sized span
    if patch.syscall_num < 0 {
        let mut size = 0;
        for i in start_idx..second_ecall_idx {
            size += window[i].length as usize;
            if size >= TYPE_MID_SIZE {
                return i + 1;
            }
        }
    }

    // a MID or SML fitting before the first ecall is the best option
    let mut size = 0;
    for i in start_idx..=syscall_idx {
        size += window[i].length as usize;
        if size >= TYPE_MID_SIZE || is_sml_patchable(patch, size, rvc) {
            return syscall_idx + 1;
        }
    }

    // as a last resort, fit a SML anywhere up to the second ecall
    let mut size = 0;
    for i in start_idx..second_ecall_idx {
        size += window[i].length as usize;
        if is_sml_patchable(patch, size, rvc) {
            return i + 1;
        }
    }

    // failed: end == start
    start_idx
}

/// Stage A: trim the window to the maximal span that may be displaced, and
/// collect the static knowledge the later stages need. Returns the byte
/// size of the span (the ecall included), 0 when nothing is patchable.
fn check_surrounding_instructions(
    jump_targets: &HashSet<usize>,
    patch: &mut PatchDesc,
    rvc: bool,
) -> usize {
    let mut window = patch.surrounding.take().expect("window already dropped");
    let syscall_idx = SYSCALL_IDX;
    let mut patch_start_idx = 0usize;
    let mut patch_end_idx = SURROUNDING_INSTRS_NUM;

    // the instruction right after the ecall may donate its destination
    // register as the jump-back carrier
    if window[syscall_idx + 1].reg_set != 0 {
        patch.return_register = window[syscall_idx + 1].reg_set;
    }

    for i in 0..SURROUNDING_INSTRS_NUM {
        if i < syscall_idx {
            if window[i].a7_set > SYSCALL_NUM_UNKNOWN {
                patch.syscall_num = window[i].a7_set;
            } else if window[i].is_a7_modified {
                patch.syscall_num = SYSCALL_NUM_UNKNOWN;
            }

            if jump_targets.contains(&window[i + 1].address) {
                // a jump may land past this instruction; nothing before it
                // can be displaced, and the a7 knowledge does not survive
                patch_start_idx = i + 1;
                patch.syscall_num = SYSCALL_NUM_UNKNOWN;
            } else if !is_copiable_before_syscall(&window[i]) {
                patch_start_idx = i + 1;
            }
        } else if i > syscall_idx {
            if window[i].is_syscall {
                patch_end_idx =
                    check_two_ecalls(patch, &window, syscall_idx, patch_start_idx, i, rvc);
                break;
            } else if !is_copiable_after_syscall(&window[i])
                || jump_targets.contains(&window[i].address)
            {
                patch_end_idx = i;
                break;
            }
        }
    }

    patch.syscall_idx = syscall_idx - patch_start_idx;
    let instrs_num = patch_end_idx.saturating_sub(patch_start_idx);
    if instrs_num < 1 {
        patch.surrounding = Some(window);
        return 0;
    }

    // shift the usable span to the left edge of the window
    window.copy_within(patch_start_idx..patch_end_idx, 0);
    for slot in window.iter_mut().skip(instrs_num) {
        *slot = InsnInfo::unset();
    }

    let mut patchable_size = 0usize;
    for (i, ins) in window.iter().take(instrs_num).enumerate() {
        patchable_size += ins.length as usize;
        if ins.is_ra_used {
            if i < patch.syscall_idx {
                patch.is_ra_used_before = true;
            } else {
                patch.is_ra_used_after = true;
            }
        }
    }

    patch.surrounding = Some(window);
    patchable_size
}

/// With compressed instructions around, the chosen start or end may fall
/// between instruction boundaries; pad with a 2 byte nop on that side.
fn check_patch_alignment(window: &[InsnInfo], patch: &mut PatchDesc, start: usize, size: usize) {
    let end = start + size;
    patch.start_with_c_nop = true;
    patch.end_with_c_nop = true;

    for ins in window {
        if start == ins.address {
            patch.start_with_c_nop = false;
        } else if end == ins.address {
            patch.end_with_c_nop = false;
        } else if ins.is_set && end < ins.address {
            break;
        }
    }
    // a patch ending at the edge of the span ends on a boundary too
    if let Some(last) = window.iter().rev().find(|i| i.is_set) {
        if end == last.address + last.length as usize {
            patch.end_with_c_nop = false;
        }
    }
}

/// Stage C: fix the overwritten range and the jump-back address.
fn position_patch(patch: &mut PatchDesc, rvc: bool) {
    let window = patch.surrounding.take().expect("window already dropped");
    let mut up_to_ecall_size = 0usize;
    for ins in window.iter().take(patch.syscall_idx + 1) {
        up_to_ecall_size += ins.length as usize;
    }

    let required_size;
    let start_addr;
    match patch.syscall_num {
        TYPE_GW => {
            required_size = TYPE_GW_SIZE;
            patch.return_address = if up_to_ecall_size >= required_size {
                patch.syscall_addr + ECALL_INS_SIZE - MODIFY_SP_INS_SIZE - STORE_LOAD_INS_SIZE
            } else {
                window[0].address + MODIFY_SP_INS_SIZE + STORE_LOAD_INS_SIZE + JUMP_2GB_INS_SIZE
            };
            start_addr = patch.return_address
                - JUMP_2GB_INS_SIZE
                - STORE_LOAD_INS_SIZE
                - MODIFY_SP_INS_SIZE;
        }
        TYPE_MID => {
            required_size = TYPE_MID_SIZE;
            patch.return_address = if up_to_ecall_size >= required_size {
                patch.syscall_addr + ECALL_INS_SIZE - MODIFY_SP_INS_SIZE - STORE_LOAD_INS_SIZE
            } else {
                window[0].address + MODIFY_SP_INS_SIZE + STORE_LOAD_INS_SIZE + JAL_INS_SIZE
            };
            start_addr =
                patch.return_address - JAL_INS_SIZE - STORE_LOAD_INS_SIZE - MODIFY_SP_INS_SIZE;
        }
        _ => {
            // SML keeps the real syscall number in syscall_num
            if patch.return_register != 0 {
                required_size = JAL_INS_SIZE;
                patch.return_address = patch.syscall_addr + JAL_INS_SIZE;
            } else {
                required_size = if rvc && patch.syscall_num < 32 {
                    JAL_INS_SIZE + C_LI_INS_SIZE
                } else {
                    JAL_INS_SIZE + ADDI_INS_SIZE
                };
                patch.return_address = if up_to_ecall_size >= required_size {
                    patch.syscall_addr + ECALL_INS_SIZE - required_size + JAL_INS_SIZE
                } else {
                    window[0].address + JAL_INS_SIZE
                };
            }
            start_addr = patch.return_address - JAL_INS_SIZE;
        }
    }

    patch.dst_jmp_patch = start_addr;
    patch.patch_size_bytes = required_size;

    if rvc {
        check_patch_alignment(&window, patch, start_addr, required_size);
        if patch.start_with_c_nop {
            patch.dst_jmp_patch -= C_NOP_INS_SIZE;
            patch.patch_size_bytes += C_NOP_INS_SIZE;
        }
        if patch.end_with_c_nop {
            patch.patch_size_bytes += C_NOP_INS_SIZE;
        }
    }

    patch.surrounding = Some(window);
}

/// Stages A-C for every site of one object, plus the relocation blocks.
/// `text` are the mapped bytes of `[text_start, text_end)`.
pub fn create_patches(desc: &mut ObjDesc, text: &[u8], writer: &mut RelocWriter, rvc: bool) {
    let mut patches = std::mem::take(&mut desc.patches);

    for patch in patches.iter_mut() {
        debug!(
            "patching {}:{:#x}",
            desc.path.to_string_lossy(),
            patch.syscall_offset
        );

        let length = check_surrounding_instructions(&desc.jump_targets, patch, rvc);

        if length >= TYPE_GW_SIZE {
            patch.syscall_num = TYPE_GW;
            patch.return_register = REG_RA;
        } else if length >= TYPE_MID_SIZE {
            patch.syscall_num = TYPE_MID;
            patch.return_register = REG_RA;
        } else if !is_sml_patchable(patch, length, rvc) {
            crate::intercept_log::log_line(&format!(
                "unintercepted syscall at: {} {:#x}",
                desc.path.to_string_lossy(),
                patch.syscall_offset
            ));
            xabort("not enough space for patching around syscall");
        }

        position_patch(patch, rvc);

        if patch.dst_jmp_patch < desc.text_start
            || patch.dst_jmp_patch + patch.patch_size_bytes > desc.text_end
        {
            xabort("patch outside text");
        }

        // keep later patches from covering this one
        desc.jump_targets
            .insert(patch.dst_jmp_patch + patch.patch_size_bytes);

        crate::reloc::relocate_instrs(patch, text, desc.text_start, writer);
        patch.drop_window();
    }

    desc.patches = patches;
    resolve_gateways(desc);
}

/// Pair every MID/SML patch with the nearest gateway its jal can reach and
/// point `dst_jmp_patch` at the gateway entry (past the leading padding;
/// MID additionally skips the gateway's `addi sp, sp, -48`).
fn resolve_gateways(desc: &mut ObjDesc) {
    let gateways: Vec<usize> = desc
        .patches
        .iter()
        .filter(|p| p.syscall_num == TYPE_GW)
        .map(|p| {
            p.dst_jmp_patch
                + if p.start_with_c_nop {
                    C_NOP_INS_SIZE
                } else {
                    0
                }
        })
        .collect();

    for patch in desc.patches.iter_mut() {
        if patch.syscall_num == TYPE_GW {
            continue;
        }
        let jal_src = patch.return_address - JAL_INS_SIZE;
        let skip = if patch.syscall_num == TYPE_MID {
            MODIFY_SP_INS_SIZE
        } else {
            0
        };

        let target = gateways
            .iter()
            .map(|&gw| gw + skip)
            .filter(|&t| (t as isize - jal_src as isize).abs() < JAL_MID_REACH)
            .min_by_key(|&t| (t as isize - jal_src as isize).abs());

        match target {
            Some(t) => patch.dst_jmp_patch = t,
            None => xabort("no gateway patch within jal reach"),
        }
    }
}
