//! Sizes, reach limits and sentinel values shared by the patching phases.

/// Instruction sizes of everything the patcher ever writes into foreign
/// text. All glue is emitted in uncompressed encodings, compressed NOPs are
/// only used to re-align a patch that starts or ends between instruction
/// boundaries of the surrounding code.
pub const ECALL_INS_SIZE: usize = 4;
pub const JAL_INS_SIZE: usize = 4;
pub const ADDI_INS_SIZE: usize = 4;
pub const MODIFY_SP_INS_SIZE: usize = 4;
pub const STORE_LOAD_INS_SIZE: usize = 4;
/// auipc + jalr
pub const JUMP_2GB_INS_SIZE: usize = 8;
pub const C_LI_INS_SIZE: usize = 2;
pub const C_NOP_INS_SIZE: usize = 2;
pub const RVC_INS_SIZE: usize = 2;

/// Full gateway patch:
/// `addi sp,sp,-48 ; sd ret,0(sp) ; auipc+jalr ; ld ret,0(sp) ; addi sp,sp,48`
pub const TYPE_GW_SIZE: usize = MODIFY_SP_INS_SIZE
    + STORE_LOAD_INS_SIZE
    + JUMP_2GB_INS_SIZE
    + STORE_LOAD_INS_SIZE
    + MODIFY_SP_INS_SIZE;

/// Mid patch, reaching a nearby gateway with a single jal:
/// `addi sp,sp,-48 ; sd ret,8(sp) ; jal ; ld ret,8(sp) ; addi sp,sp,48`
pub const TYPE_MID_SIZE: usize = MODIFY_SP_INS_SIZE
    + STORE_LOAD_INS_SIZE
    + JAL_INS_SIZE
    + STORE_LOAD_INS_SIZE
    + MODIFY_SP_INS_SIZE;

/// The window of disassembled instructions kept around every ecall. The
/// radius must cover a whole gateway patch even in all-compressed code.
pub const SURROUNDING_INSTRS_NUM: usize = 31;
pub const SYSCALL_IDX: usize = 15;

/// How far a mid or small patch may sit from the gateway its jal targets.
/// The jal immediate reaches +-1 MiB, minus a margin for the position of
/// the jal inside the patch.
pub const JAL_MID_REACH: isize = (1 << 20) - 16;

/// auipc+jalr reach, minus a page of margin.
pub const JUMP_2GB_REACH: isize = (1 << 31) - 0x1000;

/// Class tags stored in the `syscall_num` field of a patch once classified.
/// A small patch keeps the statically recovered syscall number instead, so
/// the tags live outside the valid syscall number range, distinct from the
/// error range [-0xfff, 0) and from -1 ("number unknown").
pub const TYPE_GW: i64 = -0x2000;
pub const TYPE_MID: i64 = -0x2001;
pub const TYPE_SML: i64 = -0x2002;

pub const SYSCALL_NUM_UNKNOWN: i64 = -1;

/// Sentinel pair returned from the C dispatcher to the assembly entry for
/// syscalls the C side cannot finish itself. UNH_SYSCALL goes in a0, the
/// discriminating value in a1.
pub const UNH_SYSCALL: i64 = -0x1000;
pub const UNH_GENERIC: i64 = -0x1001;
pub const UNH_CLONE: i64 = -0x1002;

/// Size of the executable scratch buffer holding relocated instructions.
/// Exhausting it is a startup abort, raise it here if that ever happens.
pub const RELOCATION_SPACE_SIZE: usize = 0x40000;

/// Trampoline written into an object that is further than 2 GiB from the
/// entry: `sd ra,32(sp)` followed by an absolute 64 bit jump.
pub const JUMP_ABS_INS_SIZE: usize = crate::encode::LI64_INS_COUNT * 4 + 4;
pub const TRAMPOLINE_SIZE: usize = STORE_LOAD_INS_SIZE + JUMP_ABS_INS_SIZE;

/// Byte offset of the trampoline arrival alias inside the assembly entry.
pub const TRAMPOLINE_JUMP_OFFSET: usize = 8;

pub const REG_ZERO: u8 = 0;
pub const REG_RA: u8 = 1;
pub const REG_SP: u8 = 2;
pub const REG_TP: u8 = 4;
pub const REG_A0: u8 = 10;
pub const REG_A7: u8 = 17;

#[test]
fn patch_sizes_are_even_and_ordered() {
    assert_eq!(TYPE_GW_SIZE, 24);
    assert_eq!(TYPE_MID_SIZE, 20);
    assert!(TYPE_MID_SIZE < TYPE_GW_SIZE);
    assert_eq!(TYPE_GW_SIZE % 2, 0);
    assert_eq!(TYPE_MID_SIZE % 2, 0);
}

#[test]
fn sentinels_are_outside_the_syscall_error_range() {
    for v in &[TYPE_GW, TYPE_MID, TYPE_SML, UNH_SYSCALL, UNH_GENERIC, UNH_CLONE] {
        assert!(*v <= -0x1000);
        assert_ne!(*v, SYSCALL_NUM_UNKNOWN);
    }
}
