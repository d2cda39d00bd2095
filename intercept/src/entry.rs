//! Bindings for the hand-written entry stub (entry.S).
//!
//! The stub is opaque to the rest of the crate; the shared knowledge is
//! narrow: the stack layout of the patch frame, the
//! `(class-or-number, relocation-address)` pair returned by
//! `detect_cur_patch`, the `UNH_*` sentinel pair, and the
//! `jalr ra, ra, 0` handshake with the relocation blocks.

use crate::util::WrapperRet;

extern "C" {
    /// Where every patch eventually lands. The trampoline arrival alias
    /// sits at `asm_entry_point + TRAMPOLINE_JUMP_OFFSET`.
    pub fn asm_entry_point();

    /// The raw ecall leaf, exported for hooks as well.
    pub fn syscall_no_intercept(
        nr: i64,
        a0: i64,
        a1: i64,
        a2: i64,
        a3: i64,
        a4: i64,
        a5: i64,
    ) -> WrapperRet;

    /// tp-relative offsets of `asm_ra_orig` / `asm_ra_temp`.
    pub fn tls_ra_slot_offsets() -> WrapperRet;
}

pub fn entry_point_addr() -> usize {
    asm_entry_point as usize
}
