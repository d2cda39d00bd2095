//! Instruction records for the scanner and planner.
//!
//! The rest of the crate only consumes the per-instruction attributes below;
//! the decoder itself is a pure function over the instruction bytes. It
//! covers the rv64gc encodings that actually occur in compiled libraries and
//! marks anything it does not recognize as not relocatable (`is_set ==
//! false`), which makes the planner shrink the patch window instead of
//! displacing bytes it does not understand.

/// What the planner knows about one decoded instruction.
#[derive(Debug, Clone, Copy)]
pub struct InsnInfo {
    pub address: usize,
    pub length: u8,
    /// false when the slot is empty or the bytes were not recognized
    pub is_set: bool,
    pub is_syscall: bool,
    /// register indirect jump (jalr, c.jr, c.jalr) - fine to displace after
    /// an ecall (returns), never before it
    pub is_abs_jump: bool,
    /// pc-relative operand (auipc, jal, branches) - never displaced
    pub has_ip_relative_opr: bool,
    /// reads or writes ra
    pub is_ra_used: bool,
    /// x-register written by the instruction, 0 when none
    pub reg_set: u8,
    /// immediate loaded into a7 by a li form, -1 otherwise
    pub a7_set: i64,
    /// any write to a7, including the li forms
    pub is_a7_modified: bool,
    /// writes sp or tp; such instructions are never displaced because the
    /// entry addresses its spill frame sp-relative while the displaced code
    /// runs
    pub modifies_stack: bool,
}

pub const REG_RA: u8 = 1;
pub const REG_SP: u8 = 2;
pub const REG_TP: u8 = 4;
pub const REG_A7: u8 = 17;

impl InsnInfo {
    pub const fn unset() -> Self {
        InsnInfo {
            address: 0,
            length: 0,
            is_set: false,
            is_syscall: false,
            is_abs_jump: false,
            has_ip_relative_opr: false,
            is_ra_used: false,
            reg_set: 0,
            a7_set: -1,
            is_a7_modified: false,
            modifies_stack: false,
        }
    }
}

struct Decoder {
    info: InsnInfo,
    target: Option<usize>,
}

impl Decoder {
    fn new(address: usize, length: u8) -> Self {
        let mut info = InsnInfo::unset();
        info.address = address;
        info.length = length;
        Decoder { info, target: None }
    }

    fn writes(&mut self, rd: u8) {
        if rd == 0 {
            return;
        }
        self.info.reg_set = rd;
        if rd == REG_RA {
            self.info.is_ra_used = true;
        }
        if rd == REG_A7 {
            self.info.is_a7_modified = true;
        }
        if rd == REG_SP || rd == REG_TP {
            self.info.modifies_stack = true;
        }
    }

    fn reads(&mut self, rs: u8) {
        if rs == REG_RA {
            self.info.is_ra_used = true;
        }
    }

    fn done(mut self) -> (InsnInfo, Option<usize>) {
        self.info.is_set = true;
        (self.info, self.target)
    }

    fn undecodable(mut self) -> (InsnInfo, Option<usize>) {
        self.info.is_set = false;
        (self.info, self.target)
    }
}

fn sext(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

fn i_imm(w: u32) -> i64 {
    ((w as i32) >> 20) as i64
}

fn b_imm(w: u32) -> i64 {
    let imm = ((w >> 31) & 1) << 12
        | ((w >> 7) & 1) << 11
        | ((w >> 25) & 0x3f) << 5
        | ((w >> 8) & 0xf) << 1;
    sext(imm, 13)
}

fn j_imm(w: u32) -> i64 {
    let imm = ((w >> 31) & 1) << 20
        | ((w >> 12) & 0xff) << 12
        | ((w >> 20) & 1) << 11
        | ((w >> 21) & 0x3ff) << 1;
    sext(imm, 21)
}

/// FP instructions in the 0x53 major opcode that move data into an
/// x-register: comparisons, fcvt-to-integer, fmv.x and fclass.
fn fp_op_writes_xreg(funct7: u32) -> bool {
    matches!(funct7 & 0x7c, 0x50 | 0x60 | 0x70)
}

fn fp_op_reads_xreg(funct7: u32) -> bool {
    // fcvt from integer, fmv.w.x / fmv.d.x
    matches!(funct7 & 0x7c, 0x68 | 0x78)
}

fn decode32(address: usize, w: u32) -> (InsnInfo, Option<usize>) {
    let mut d = Decoder::new(address, 4);
    let opcode = w & 0x7f;
    let rd = ((w >> 7) & 0x1f) as u8;
    let rs1 = ((w >> 15) & 0x1f) as u8;
    let rs2 = ((w >> 20) & 0x1f) as u8;
    let funct3 = (w >> 12) & 7;
    let funct7 = w >> 25;

    match opcode {
        0x37 => d.writes(rd), // lui
        0x17 => {
            // auipc
            d.info.has_ip_relative_opr = true;
            d.writes(rd);
        }
        0x6f => {
            // jal
            d.info.has_ip_relative_opr = true;
            d.writes(rd);
            d.target = Some((address as i64 + j_imm(w)) as usize);
        }
        0x67 => {
            // jalr
            d.info.is_abs_jump = true;
            d.writes(rd);
            d.reads(rs1);
        }
        0x63 => {
            // conditional branches
            d.info.has_ip_relative_opr = true;
            d.reads(rs1);
            d.reads(rs2);
            d.target = Some((address as i64 + b_imm(w)) as usize);
        }
        0x03 => {
            // integer loads
            d.writes(rd);
            d.reads(rs1);
        }
        0x07 => d.reads(rs1), // fp loads write an f-register
        0x23 => {
            // integer stores
            d.reads(rs1);
            d.reads(rs2);
        }
        0x27 => d.reads(rs1), // fp stores
        0x13 | 0x1b => {
            // op-imm / op-imm-32
            d.writes(rd);
            d.reads(rs1);
            if opcode == 0x13 && funct3 == 0 && rs1 == 0 && rd == REG_A7 {
                d.info.a7_set = i_imm(w);
            }
        }
        0x33 | 0x3b => {
            // op / op-32
            d.writes(rd);
            d.reads(rs1);
            d.reads(rs2);
        }
        0x2f => {
            // atomics
            d.writes(rd);
            d.reads(rs1);
            d.reads(rs2);
        }
        0x0f => (), // fence / fence.i
        0x53 => {
            if fp_op_writes_xreg(funct7) {
                d.writes(rd);
            }
            if fp_op_reads_xreg(funct7) {
                d.reads(rs1);
            }
        }
        0x43 | 0x47 | 0x4b | 0x4f => (), // fused multiply-add, all fp
        0x73 => {
            if w == 0x0000_0073 {
                d.info.is_syscall = true;
            } else if funct3 != 0 && funct3 != 4 {
                // csr accesses
                d.writes(rd);
                if funct3 < 4 {
                    d.reads(rs1);
                }
            } else {
                // ebreak, *ret, wfi, ...
                return d.undecodable();
            }
        }
        _ => return d.undecodable(),
    }
    d.done()
}

fn creg(bits: u16) -> u8 {
    8 + (bits & 7) as u8
}

fn cj_imm(h: u16) -> i64 {
    let b = |i: u32| ((h >> i) & 1) as u32;
    let imm = b(12) << 11
        | b(11) << 4
        | b(10) << 9
        | b(9) << 8
        | b(8) << 10
        | b(7) << 6
        | b(6) << 7
        | b(5) << 3
        | b(4) << 2
        | b(3) << 1
        | b(2) << 5;
    sext(imm, 12)
}

fn cb_imm(h: u16) -> i64 {
    let b = |i: u32| ((h >> i) & 1) as u32;
    let imm = b(12) << 8
        | b(11) << 4
        | b(10) << 3
        | b(6) << 7
        | b(5) << 6
        | b(4) << 2
        | b(3) << 1
        | b(2) << 5;
    sext(imm, 9)
}

fn c_li_imm(h: u16) -> i64 {
    let imm = (((h >> 12) & 1) << 5 | ((h >> 2) & 0x1f)) as u32;
    sext(imm, 6)
}

fn decode16(address: usize, h: u16) -> (InsnInfo, Option<usize>) {
    let mut d = Decoder::new(address, 2);
    let funct3 = (h >> 13) & 7;
    let rd = ((h >> 7) & 0x1f) as u8;
    let rs2 = ((h >> 2) & 0x1f) as u8;

    match h & 3 {
        0b00 => match funct3 {
            0 => {
                if h == 0 {
                    return d.undecodable();
                }
                // c.addi4spn
                d.writes(creg(h >> 2));
                d.reads(REG_SP);
            }
            1 | 5 => d.reads(creg(h >> 7)), // c.fld / c.fsd
            2 | 3 => {
                // c.lw / c.ld
                d.writes(creg(h >> 2));
                d.reads(creg(h >> 7));
            }
            6 | 7 => {
                // c.sw / c.sd
                d.reads(creg(h >> 7));
                d.reads(creg(h >> 2));
            }
            _ => return d.undecodable(),
        },
        0b01 => match funct3 {
            0 => {
                // c.addi (c.nop when rd == 0)
                d.writes(rd);
                d.reads(rd);
            }
            1 => {
                // c.addiw
                if rd == 0 {
                    return d.undecodable();
                }
                d.writes(rd);
                d.reads(rd);
            }
            2 => {
                // c.li
                d.writes(rd);
                if rd == REG_A7 {
                    d.info.a7_set = c_li_imm(h);
                }
            }
            3 => {
                // c.addi16sp / c.lui
                if rd == REG_SP {
                    d.writes(REG_SP);
                    d.reads(REG_SP);
                } else if rd != 0 {
                    d.writes(rd);
                } else {
                    return d.undecodable();
                }
            }
            4 => {
                // alu ops on the compressed register set
                let r = creg(h >> 7);
                d.writes(r);
                d.reads(r);
                if (h >> 10) & 3 == 3 {
                    d.reads(creg(h >> 2));
                }
            }
            5 => {
                // c.j
                d.info.has_ip_relative_opr = true;
                d.target = Some((address as i64 + cj_imm(h)) as usize);
            }
            6 | 7 => {
                // c.beqz / c.bnez
                d.info.has_ip_relative_opr = true;
                d.reads(creg(h >> 7));
                d.target = Some((address as i64 + cb_imm(h)) as usize);
            }
            _ => return d.undecodable(),
        },
        0b10 => match funct3 {
            0 => {
                // c.slli
                d.writes(rd);
                d.reads(rd);
            }
            1 => d.reads(REG_SP), // c.fldsp
            2 | 3 => {
                // c.lwsp / c.ldsp
                if rd == 0 {
                    return d.undecodable();
                }
                d.writes(rd);
                d.reads(REG_SP);
            }
            4 => {
                let bit12 = (h >> 12) & 1;
                match (bit12, rd, rs2) {
                    (0, 0, 0) => return d.undecodable(),
                    (0, rs1, 0) => {
                        // c.jr
                        d.info.is_abs_jump = true;
                        d.reads(rs1);
                    }
                    (0, rd, rs2) => {
                        // c.mv
                        d.writes(rd);
                        d.reads(rs2);
                    }
                    (1, 0, 0) => return d.undecodable(), // c.ebreak
                    (1, rs1, 0) => {
                        // c.jalr
                        d.info.is_abs_jump = true;
                        d.writes(REG_RA);
                        d.reads(rs1);
                    }
                    (1, rd, rs2) => {
                        // c.add
                        d.writes(rd);
                        d.reads(rd);
                        d.reads(rs2);
                    }
                    _ => return d.undecodable(),
                }
            }
            5 => d.reads(REG_SP), // c.fsdsp
            6 | 7 => {
                // c.swsp / c.sdsp
                d.reads(REG_SP);
                d.reads(rs2);
            }
            _ => return d.undecodable(),
        },
        _ => return d.undecodable(),
    }
    d.done()
}

/// Decode one instruction at `address`. Returns the record and, for direct
/// jumps and branches, the target address. `bytes` are the remaining text
/// bytes starting at `address`.
pub fn decode(address: usize, bytes: &[u8], rvc: bool) -> (InsnInfo, Option<usize>) {
    if bytes.len() < 2 {
        let mut info = InsnInfo::unset();
        info.address = address;
        info.length = bytes.len() as u8;
        return (info, None);
    }
    let first = u16::from_le_bytes([bytes[0], bytes[1]]);
    if first & 3 != 3 {
        if rvc {
            return decode16(address, first);
        }
        // no compressed extension: skip the halfword pair as opaque data
        let mut info = InsnInfo::unset();
        info.address = address;
        info.length = if bytes.len() >= 4 { 4 } else { 2 };
        return (info, None);
    }
    if bytes.len() < 4 {
        let mut info = InsnInfo::unset();
        info.address = address;
        info.length = bytes.len() as u8;
        return (info, None);
    }
    let w = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    decode32(address, w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec32(addr: usize, w: u32) -> (InsnInfo, Option<usize>) {
        decode(addr, &w.to_le_bytes(), true)
    }

    fn dec16(addr: usize, h: u16) -> (InsnInfo, Option<usize>) {
        decode(addr, &h.to_le_bytes(), true)
    }

    #[test]
    fn ecall_is_a_syscall() {
        let (info, _) = dec32(0x100, 0x0000_0073);
        assert!(info.is_set && info.is_syscall);
        assert_eq!(info.length, 4);
    }

    #[test]
    fn li_a7_sets_the_syscall_number() {
        // li a7, 64
        let (info, _) = dec32(0x100, 0x0400_0893);
        assert_eq!(info.a7_set, 64);
        assert!(info.is_a7_modified);
        assert_eq!(info.reg_set, REG_A7);
        // mv a7, a0 clobbers without a known immediate
        let (info, _) = dec32(0x100, 0x0005_0893); // addi a7, a0, 0
        assert_eq!(info.a7_set, -1);
        assert!(info.is_a7_modified);
    }

    #[test]
    fn c_li_a7_sets_the_syscall_number() {
        let (info, _) = dec16(0x100, crate::encode::c_li(REG_A7, 5));
        assert_eq!(info.a7_set, 5);
        assert_eq!(info.length, 2);
    }

    #[test]
    fn ra_usage_is_tracked() {
        // sd ra, 0(sp)
        let (info, _) = dec32(0x100, 0x0011_3023);
        assert!(info.is_ra_used);
        assert!(!info.is_abs_jump);
        // ld ra, 0(sp)
        let (info, _) = dec32(0x100, 0x0001_3083);
        assert!(info.is_ra_used);
        assert_eq!(info.reg_set, REG_RA);
        // ret == c.jr ra
        let (info, _) = dec16(0x100, 0x8082);
        assert!(info.is_ra_used && info.is_abs_jump);
    }

    #[test]
    fn branches_are_ip_relative_with_targets() {
        // beq a0, zero, .+16  (bits: imm 16)
        let w = 0x0005_0863_u32 | 0; // beqz a0, +16
        let (info, target) = dec32(0x1000, w);
        assert!(info.has_ip_relative_opr);
        assert_eq!(target, Some(0x1010));

        // jal checked in encode tests; c.j here
        let (info, target) = dec16(0x1000, 0xa001); // c.j .+0
        assert!(info.has_ip_relative_opr);
        assert_eq!(target, Some(0x1000));
    }

    #[test]
    fn sp_writers_are_flagged() {
        let (info, _) = dec32(0x100, crate::encode::addi_sp(-32));
        assert!(info.modifies_stack);
        // c.addi16sp: funct3 011, rd=2, nonzero imm (bit 6 -> imm 16)
        let (info, _) = dec16(0x100, 0x6141);
        assert!(info.modifies_stack || info.reg_set == REG_SP);
        // plain addi a0 is not
        let (info, _) = dec32(0x100, crate::encode::addi(10, 10, 8));
        assert!(!info.modifies_stack);
    }

    #[test]
    fn unknown_bytes_are_not_relocatable() {
        let (info, _) = dec32(0x100, 0xffff_ffff);
        assert!(!info.is_set);
        assert_eq!(info.length, 4);
        // ebreak
        let (info, _) = dec32(0x100, 0x0010_0073);
        assert!(!info.is_set);
    }

    #[test]
    fn auipc_is_ip_relative() {
        let (info, _) = dec32(0x100, crate::encode::auipc(10, 1));
        assert!(info.has_ip_relative_opr);
        assert_eq!(info.reg_set, 10);
    }
}
