//! The relocation buffer: displaced instructions plus the glue that hands
//! control back and forth between the patched text and the assembly entry.

use crate::consts::*;
use crate::encode;
use crate::patch::PatchDesc;
use crate::util::{clear_cache, mprotect_no_intercept, xabort};

/// Process wide executable scratch space. Writable only while the blocks
/// are emitted, read+execute for the rest of the process lifetime.
#[repr(C, align(4096))]
pub struct RelocationSpace(pub [u8; RELOCATION_SPACE_SIZE]);

#[no_mangle]
pub static mut ASM_RELOCATION_SPACE: RelocationSpace = RelocationSpace([0; RELOCATION_SPACE_SIZE]);

pub fn relocation_space() -> (usize, usize) {
    let base = unsafe { std::ptr::addr_of!(ASM_RELOCATION_SPACE) as usize };
    (base, RELOCATION_SPACE_SIZE)
}

pub fn write_enable_relocation_space(enable: bool) {
    let (base, len) = relocation_space();
    if enable {
        mprotect_no_intercept(
            base,
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            "relocation space write enable",
        );
    } else {
        clear_cache(base, base + len);
        mprotect_no_intercept(
            base,
            len,
            libc::PROT_READ | libc::PROT_EXEC,
            "relocation space write disable",
        );
    }
}

/// tp-relative offsets of the two thread local words the displaced code
/// uses to juggle the ra register (see `entry.S`).
#[derive(Clone, Copy, Debug, Default)]
pub struct TlsOffsets {
    pub ra_orig: i32,
    pub ra_temp: i32,
}

static mut TLS_OFFSETS: TlsOffsets = TlsOffsets {
    ra_orig: 0,
    ra_temp: 0,
};

fn check_tls_offset(off: i64) -> i32 {
    // the emitted ld/sd reach tp +- 2 KiB; the two words sit at the very
    // start of this library's tls block, so this only trips when the
    // static tls layout changes radically
    if off < -0x800 || off >= 0x800 {
        xabort("tls offset out of range");
    }
    off as i32
}

pub fn init_tls_offset_table() {
    #[cfg(target_arch = "riscv64")]
    {
        let ret = unsafe { crate::entry::tls_ra_slot_offsets() };
        unsafe {
            TLS_OFFSETS = TlsOffsets {
                ra_orig: check_tls_offset(ret.a0),
                ra_temp: check_tls_offset(ret.a1),
            };
        }
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = check_tls_offset(0);
    }
}

fn tls_offsets() -> TlsOffsets {
    unsafe { TLS_OFFSETS }
}

#[cfg(test)]
pub fn set_tls_offsets(off: TlsOffsets) {
    unsafe {
        TLS_OFFSETS = off;
    }
}

/// Appends bytes at a monotonically advancing cursor. The writes go through
/// raw pointers, the target is executable memory, not a rust slice anyone
/// else may alias.
pub struct RelocWriter {
    base: usize,
    len: usize,
    cursor: usize,
}

impl RelocWriter {
    /// Writer over the process wide relocation space.
    pub fn new() -> Self {
        let (base, len) = relocation_space();
        RelocWriter {
            base,
            len,
            cursor: 0,
        }
    }

    /// Writer over caller provided memory (tests).
    pub unsafe fn over(base: usize, len: usize) -> Self {
        RelocWriter { base, len, cursor: 0 }
    }

    pub fn cur_address(&self) -> usize {
        self.base + self.cursor
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        if self.cursor + bytes.len() > self.len {
            xabort("not enough space in relocation space");
        }
        unsafe {
            let dst = (self.base + self.cursor) as *mut u8;
            for (i, &b) in bytes.iter().enumerate() {
                dst.add(i).write_volatile(b);
            }
        }
        self.cursor += bytes.len();
    }

    fn push32(&mut self, word: u32) {
        self.push_bytes(&word.to_le_bytes());
    }
}

/// Swap the entry's ra for the caller's: the displaced instructions are the
/// only code running with foreign expectations about ra while the entry is
/// in control.
fn load_orig_ra_temp(w: &mut RelocWriter) {
    let tls = tls_offsets();
    w.push32(encode::sd(REG_RA, REG_TP, tls.ra_temp));
    w.push32(encode::ld(REG_RA, REG_TP, tls.ra_orig));
}

fn store_new_ra_temp(w: &mut RelocWriter) {
    let tls = tls_offsets();
    w.push32(encode::sd(REG_RA, REG_TP, tls.ra_orig));
    w.push32(encode::ld(REG_RA, REG_TP, tls.ra_temp));
}

/// The `jalr ra, ra, 0` handshake: jump to the address in ra, leaving the
/// address of the next block section in ra for the entry to hold on to.
fn copy_jump(w: &mut RelocWriter) {
    w.push32(encode::jalr(REG_RA, REG_RA, 0));
}

/// The tail of every block: reshape the stack for the class and jump back
/// into the patched text. The entry stored the caller's ra at 0(sp) and
/// the text return address at 16(sp) by the time this runs.
fn finalize_and_jump_back(w: &mut RelocWriter, patch: &PatchDesc) {
    let mut ret_reg = patch.return_register;

    // load the original ra value if it is not the jump-back carrier
    if ret_reg != REG_RA {
        w.push32(encode::ld(REG_RA, REG_SP, 0));
    }

    match patch.syscall_num {
        TYPE_GW => {
            w.push32(encode::ld(ret_reg, REG_SP, 16));
        }
        TYPE_MID => {
            // the MID patch restores the original ra from 8(sp) rather
            // than 0(sp); reshape the stack accordingly
            w.push32(encode::ld(ret_reg, REG_SP, 0));
            w.push32(encode::sd(ret_reg, REG_SP, 8));
            w.push32(encode::ld(ret_reg, REG_SP, 16));
        }
        _ => {
            // when nothing was captured, SML jumps back through a7
            if ret_reg == 0 {
                ret_reg = REG_A7;
            }
            w.push32(encode::ld(ret_reg, REG_SP, 16));
            // the SML patch allocates no stack of its own, but the gateway
            // it borrowed dropped sp by 48
            w.push32(encode::addi_sp(48));
        }
    }

    w.push32(encode::jalr(REG_ZERO, ret_reg, 0));
}

/// Emit one patch's block: displaced prefix, handshake, displaced suffix,
/// handshake, finalization. `text` holds the object's mapped text bytes
/// starting at `text_start`.
pub fn relocate_instrs(
    patch: &mut PatchDesc,
    text: &[u8],
    text_start: usize,
    w: &mut RelocWriter,
) {
    patch.relocation_address = w.cur_address();

    let start = patch.dst_jmp_patch;
    let before_size = patch.syscall_addr - start;

    if patch.is_ra_used_before {
        load_orig_ra_temp(w);
    }
    w.push_bytes(&text[start - text_start..start - text_start + before_size]);
    if patch.is_ra_used_before {
        store_new_ra_temp(w);
    }
    copy_jump(w);

    let after_start = patch.syscall_addr + ECALL_INS_SIZE;
    let after_size = start + patch.patch_size_bytes - after_start;
    if after_size > 0 {
        if patch.is_ra_used_after {
            load_orig_ra_temp(w);
        }
        w.push_bytes(&text[after_start - text_start..after_start - text_start + after_size]);
        if patch.is_ra_used_after {
            store_new_ra_temp(w);
        }
    }
    copy_jump(w);

    finalize_and_jump_back(w, patch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::InsnInfo;
    use crate::encode::{addi, addi_sp, jalr, ld, sd};

    const ECALL: u32 = 0x0000_0073;

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn gw_patch(text_start: usize) -> PatchDesc {
        // text: 6 filler words, ecall, 6 filler words
        let mut p = PatchDesc::new(
            text_start + 24,
            24,
            vec![InsnInfo::unset(); SURROUNDING_INSTRS_NUM],
            -1,
        );
        p.syscall_num = TYPE_GW;
        p.return_register = REG_RA;
        p.dst_jmp_patch = text_start + 4; // 20 bytes of prefix, ecall, 0 suffix
        p.patch_size_bytes = TYPE_GW_SIZE;
        p.return_address = text_start + 20;
        p
    }

    fn sample_text() -> Vec<u8> {
        let mut buf = Vec::new();
        for _ in 0..6 {
            encode::push32(&mut buf, addi(13, 13, 1));
        }
        encode::push32(&mut buf, ECALL);
        for _ in 0..6 {
            encode::push32(&mut buf, addi(13, 13, 1));
        }
        buf
    }

    #[test]
    fn gateway_block_layout() {
        let text = sample_text();
        let text_start = 0x4000_0000;
        let mut patch = gw_patch(text_start);
        let mut buf = vec![0u8; 0x1000];
        let mut w = unsafe { RelocWriter::over(buf.as_mut_ptr() as usize, buf.len()) };

        relocate_instrs(&mut patch, &text, text_start, &mut w);

        assert_eq!(patch.relocation_address, buf.as_ptr() as usize);
        let got = words(&buf[..w.cursor]);
        let mut expect = Vec::new();
        // five displaced prefix words
        for _ in 0..5 {
            expect.push(addi(13, 13, 1));
        }
        expect.push(jalr(REG_RA, REG_RA, 0)); // back to the entry
        // no suffix: the second handshake follows immediately
        expect.push(jalr(REG_RA, REG_RA, 0));
        // finalize: ret_reg is ra, GW loads the return address from 16(sp)
        expect.push(ld(REG_RA, REG_SP, 16));
        expect.push(jalr(REG_ZERO, REG_RA, 0));
        assert_eq!(got, expect);
    }

    #[test]
    fn ra_users_get_the_tls_dance() {
        set_tls_offsets(TlsOffsets {
            ra_orig: 0x10,
            ra_temp: 0x18,
        });
        let text = sample_text();
        let text_start = 0x4000_0000;
        let mut patch = gw_patch(text_start);
        patch.is_ra_used_before = true;
        let mut buf = vec![0u8; 0x1000];
        let mut w = unsafe { RelocWriter::over(buf.as_mut_ptr() as usize, buf.len()) };

        relocate_instrs(&mut patch, &text, text_start, &mut w);

        let got = words(&buf[..w.cursor]);
        assert_eq!(got[0], sd(REG_RA, REG_TP, 0x18)); // stash entry ra
        assert_eq!(got[1], ld(REG_RA, REG_TP, 0x10)); // caller ra in
        // after the prefix the swap is undone
        assert_eq!(got[7], sd(REG_RA, REG_TP, 0x10));
        assert_eq!(got[8], ld(REG_RA, REG_TP, 0x18));
        assert_eq!(got[9], jalr(REG_RA, REG_RA, 0));
    }

    #[test]
    fn sml_block_reshapes_the_stack() {
        let text = sample_text();
        let text_start = 0x4000_0000;
        // SML with a return register: the jal replaced the ecall exactly
        let mut patch = PatchDesc::new(
            text_start + 24,
            24,
            vec![InsnInfo::unset(); SURROUNDING_INSTRS_NUM],
            64,
        );
        patch.return_register = 15;
        patch.dst_jmp_patch = text_start + 24;
        patch.patch_size_bytes = JAL_INS_SIZE;
        patch.return_address = text_start + 28;

        let mut buf = vec![0u8; 0x1000];
        let mut w = unsafe { RelocWriter::over(buf.as_mut_ptr() as usize, buf.len()) };
        relocate_instrs(&mut patch, &text, text_start, &mut w);

        let got = words(&buf[..w.cursor]);
        let expect = vec![
            jalr(REG_RA, REG_RA, 0), // empty prefix handshake
            jalr(REG_RA, REG_RA, 0), // empty suffix handshake
            ld(REG_RA, REG_SP, 0),   // restore caller ra
            ld(15, REG_SP, 16),      // return address into a5
            addi_sp(48),             // undo the gateway's frame
            jalr(REG_ZERO, 15, 0),
        ];
        assert_eq!(got, expect);
    }

    #[test]
    fn mid_block_moves_the_saved_ra() {
        let text = sample_text();
        let text_start = 0x4000_0000;
        let mut patch = gw_patch(text_start);
        patch.syscall_num = TYPE_MID;
        patch.patch_size_bytes = TYPE_MID_SIZE;
        patch.dst_jmp_patch = text_start + 8;
        patch.return_address = text_start + 20;

        let mut buf = vec![0u8; 0x1000];
        let mut w = unsafe { RelocWriter::over(buf.as_mut_ptr() as usize, buf.len()) };
        relocate_instrs(&mut patch, &text, text_start, &mut w);

        let got = words(&buf[..w.cursor]);
        let tail = &got[got.len() - 4..];
        assert_eq!(tail[0], ld(REG_RA, REG_SP, 0));
        assert_eq!(tail[1], sd(REG_RA, REG_SP, 8));
        assert_eq!(tail[2], ld(REG_RA, REG_SP, 16));
        assert_eq!(tail[3], jalr(REG_ZERO, REG_RA, 0));
    }
}
