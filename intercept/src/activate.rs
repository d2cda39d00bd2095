//! Writing the patch bytes into the target text.

use crate::consts::*;
use crate::encode;
use crate::obj::ObjDesc;
use crate::patch::PatchDesc;
use crate::util::{clear_cache, mprotect_no_intercept, round_down_page, round_up_page, xabort};

/// Decide whether the object needs a trampoline to reach the entry, and
/// where it goes: the zero padding between the end of the text and the end
/// of its last page.
pub fn allocate_trampoline(desc: &mut ObjDesc, entry_addr: usize) {
    if desc.patches.is_empty() {
        return;
    }
    let d1 = (desc.text_start as isize - entry_addr as isize).abs();
    let d2 = (desc.text_end as isize - entry_addr as isize).abs();
    if d1.max(d2) < JUMP_2GB_REACH {
        desc.uses_trampoline = false;
        return;
    }

    let tramp = (desc.text_end + 7) & !7;
    if tramp + TRAMPOLINE_SIZE > round_up_page(desc.text_end) {
        xabort("no room for a trampoline behind the text");
    }
    desc.trampoline_address = tramp;
    desc.uses_trampoline = true;
}

/// `sd ra, 32(sp)` plus an absolute jump to the trampoline arrival alias
/// of the entry. ra holds the gateway return key at this point and the
/// jump itself needs ra as scratch, hence the spill.
fn trampoline_bytes(destination: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TRAMPOLINE_SIZE);
    encode::push32(&mut buf, encode::sd(REG_RA, REG_SP, 32));
    encode::jump_abs(&mut buf, REG_ZERO, REG_RA, destination);
    debug_assert_eq!(buf.len(), TRAMPOLINE_SIZE);
    buf
}

fn gw_bytes(patch: &PatchDesc, destination: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(patch.patch_size_bytes);
    let ret = patch.return_register;
    if patch.start_with_c_nop {
        encode::push16(&mut buf, encode::c_nop());
    }
    encode::push32(&mut buf, encode::addi_sp(-48));
    encode::push32(&mut buf, encode::sd(ret, REG_SP, 0));
    let auipc_addr = patch.return_address - JUMP_2GB_INS_SIZE;
    for w in &encode::jump_2gb(ret, ret, auipc_addr, destination) {
        encode::push32(&mut buf, *w);
    }
    encode::push32(&mut buf, encode::ld(ret, REG_SP, 0));
    encode::push32(&mut buf, encode::addi_sp(48));
    if patch.end_with_c_nop {
        encode::push16(&mut buf, encode::c_nop());
    }
    debug_assert_eq!(buf.len(), patch.patch_size_bytes);
    buf
}

fn mid_bytes(patch: &PatchDesc) -> Vec<u8> {
    let mut buf = Vec::with_capacity(patch.patch_size_bytes);
    let ret = patch.return_register;
    let jal_addr = patch.return_address - JAL_INS_SIZE;
    if patch.start_with_c_nop {
        encode::push16(&mut buf, encode::c_nop());
    }
    encode::push32(&mut buf, encode::addi_sp(-48));
    encode::push32(&mut buf, encode::sd(ret, REG_SP, 8));
    // dst_jmp_patch was redirected to the gateway entry (past its addi sp)
    encode::push32(&mut buf, encode::jal(ret, jal_addr, patch.dst_jmp_patch));
    encode::push32(&mut buf, encode::ld(ret, REG_SP, 8));
    encode::push32(&mut buf, encode::addi_sp(48));
    if patch.end_with_c_nop {
        encode::push16(&mut buf, encode::c_nop());
    }
    debug_assert_eq!(buf.len(), patch.patch_size_bytes);
    buf
}

fn sml_bytes(patch: &PatchDesc, rvc: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(patch.patch_size_bytes);
    let jal_addr = patch.return_address - JAL_INS_SIZE;
    if patch.start_with_c_nop {
        encode::push16(&mut buf, encode::c_nop());
    }
    // a7 carries the return key; the gateway this lands in does the rest
    encode::push32(&mut buf, encode::jal(REG_A7, jal_addr, patch.dst_jmp_patch));
    if patch.return_register == 0 {
        // put the syscall number back for the code following the ecall
        if rvc && patch.syscall_num < 32 {
            encode::push16(&mut buf, encode::c_li(REG_A7, patch.syscall_num as i32));
        } else {
            encode::push32(&mut buf, encode::li(REG_A7, patch.syscall_num as i32));
        }
    }
    if patch.end_with_c_nop {
        encode::push16(&mut buf, encode::c_nop());
    }
    debug_assert_eq!(buf.len(), patch.patch_size_bytes);
    buf
}

/// First byte the class sequence is written to. For GW that is
/// `dst_jmp_patch` itself; MID/SML lost that meaning during gateway
/// resolution and derive it from the return address.
fn patch_write_start(patch: &PatchDesc) -> usize {
    let pad = if patch.start_with_c_nop {
        C_NOP_INS_SIZE
    } else {
        0
    };
    match patch.syscall_num {
        TYPE_GW => patch.dst_jmp_patch,
        TYPE_MID => {
            patch.return_address - JAL_INS_SIZE - STORE_LOAD_INS_SIZE - MODIFY_SP_INS_SIZE - pad
        }
        _ => patch.return_address - JAL_INS_SIZE - pad,
    }
}

/// Byte-by-byte store; this must not call into the library being patched.
unsafe fn poke(addr: usize, bytes: &[u8]) {
    let dst = addr as *mut u8;
    for (i, &b) in bytes.iter().enumerate() {
        dst.add(i).write_volatile(b);
    }
}

/// Overwrite every planned site of one object, behind a temporary
/// page-protection flip, with an instruction cache flush before the pages
/// go back to read+execute.
pub fn activate_patches(desc: &ObjDesc, entry_addr: usize, rvc: bool) {
    if desc.patches.is_empty() {
        return;
    }

    let first_page = round_down_page(desc.text_start);
    let last = if desc.uses_trampoline {
        round_up_page(desc.trampoline_address + TRAMPOLINE_SIZE)
    } else {
        round_up_page(desc.text_end)
    };
    let size = last - first_page;

    mprotect_no_intercept(
        first_page,
        size,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        "mprotect PROT_READ | PROT_WRITE | PROT_EXEC",
    );

    if desc.uses_trampoline {
        let bytes = trampoline_bytes(entry_addr + TRAMPOLINE_JUMP_OFFSET);
        unsafe { poke(desc.trampoline_address, &bytes) };
    }

    let gw_destination = if desc.uses_trampoline {
        desc.trampoline_address
    } else {
        entry_addr
    };

    for patch in &desc.patches {
        let start = patch_write_start(patch);
        if start < desc.text_start || start + patch.patch_size_bytes > desc.text_end {
            xabort("patch bytes outside text");
        }
        let bytes = match patch.syscall_num {
            TYPE_GW => gw_bytes(patch, gw_destination),
            TYPE_MID => mid_bytes(patch),
            _ => sml_bytes(patch, rvc),
        };
        unsafe { poke(start, &bytes) };
    }

    clear_cache(first_page, first_page + size);

    mprotect_no_intercept(
        first_page,
        size,
        libc::PROT_READ | libc::PROT_EXEC,
        "mprotect PROT_READ | PROT_EXEC",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{decode, InsnInfo};

    fn base_patch(num: i64) -> PatchDesc {
        let mut p = PatchDesc::new(0, 0, vec![InsnInfo::unset(); SURROUNDING_INSTRS_NUM], num);
        p.return_register = REG_RA;
        p
    }

    #[test]
    fn gw_sequence_has_the_documented_shape() {
        let mut p = base_patch(TYPE_GW);
        p.dst_jmp_patch = 0x2000_0000;
        p.patch_size_bytes = TYPE_GW_SIZE;
        p.return_address = 0x2000_0010;

        let bytes = gw_bytes(&p, 0x2100_0000);
        assert_eq!(bytes.len(), TYPE_GW_SIZE);
        let w0 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(w0, encode::addi_sp(-48));
        let w1 = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(w1, encode::sd(REG_RA, REG_SP, 0));
        // the auipc executes 8 bytes before the return address
        let (info, _) = decode(0, &bytes[8..12], false);
        assert!(info.has_ip_relative_opr); // auipc
        let w5 = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        assert_eq!(w5, encode::addi_sp(48));
    }

    #[test]
    fn sml_sequence_reloads_small_numbers_compressed() {
        let mut p = base_patch(15); // statically known number
        p.return_register = 0;
        p.dst_jmp_patch = 0x2000_0000; // gateway entry after resolution
        p.return_address = 0x2000_4004;
        p.patch_size_bytes = JAL_INS_SIZE + C_LI_INS_SIZE;

        let bytes = sml_bytes(&p, true);
        assert_eq!(bytes.len(), 6);
        let tail = u16::from_le_bytes([bytes[4], bytes[5]]);
        assert_eq!(tail, encode::c_li(REG_A7, 15));

        // without the compressed extension the reload is a full li
        p.patch_size_bytes = JAL_INS_SIZE + ADDI_INS_SIZE;
        let bytes = sml_bytes(&p, false);
        assert_eq!(bytes.len(), 8);
        let tail = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(tail, encode::li(REG_A7, 15));
    }

    #[test]
    fn padded_patches_emit_compressed_nops() {
        let mut p = base_patch(TYPE_MID);
        p.dst_jmp_patch = 0x2000_0004; // gateway entry
        p.return_address = 0x2000_4010;
        p.start_with_c_nop = true;
        p.end_with_c_nop = true;
        p.patch_size_bytes = TYPE_MID_SIZE + 2 * C_NOP_INS_SIZE;

        let bytes = mid_bytes(&p);
        assert_eq!(bytes.len(), p.patch_size_bytes);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), encode::c_nop());
        let n = bytes.len();
        assert_eq!(
            u16::from_le_bytes([bytes[n - 2], bytes[n - 1]]),
            encode::c_nop()
        );
        // write start accounts for the leading pad
        assert_eq!(
            patch_write_start(&p),
            p.return_address - JAL_INS_SIZE - STORE_LOAD_INS_SIZE - MODIFY_SP_INS_SIZE - 2
        );
    }

    #[test]
    fn trampoline_fits_its_reserved_size() {
        let bytes = trampoline_bytes(0x7f12_3456_7890);
        assert_eq!(bytes.len(), TRAMPOLINE_SIZE);
        let w0 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(w0, encode::sd(REG_RA, REG_SP, 32));
    }
}
