//! Scanning an object's text for ecall instructions.

use std::fs;
use std::io::{Error, ErrorKind, Result};

use goblin::elf::section_header::SHF_EXECINSTR;
use goblin::elf::Elf;
use log::debug;

use crate::consts::*;
use crate::disasm::{decode, InsnInfo};
use crate::obj::ObjDesc;
use crate::patch::PatchDesc;

/// Executable extent of the object, from the section headers of the on-disk
/// file. Program headers are too coarse here: an executable segment may
/// carry read-only data behind the code, and disassembling data would
/// produce phantom ecalls.
fn find_text_extent(elf: &Elf) -> Result<(usize, usize)> {
    let mut lo = usize::MAX;
    let mut hi = 0usize;
    for sh in &elf.section_headers {
        if sh.sh_flags & u64::from(SHF_EXECINSTR) == 0 || sh.sh_size == 0 {
            continue;
        }
        lo = lo.min(sh.sh_addr as usize);
        hi = hi.max((sh.sh_addr + sh.sh_size) as usize);
    }
    if lo >= hi {
        return Err(Error::new(ErrorKind::Other, "no executable sections"));
    }
    Ok((lo, hi))
}

/// First pass: every address a direct jump or branch inside the text lands
/// on. A patch straddling one of these would be entered mid-sequence.
fn build_jump_targets(desc: &mut ObjDesc, text: &[u8], rvc: bool) {
    let mut offset = 0usize;
    while offset < text.len() {
        let addr = desc.text_start + offset;
        let (info, target) = decode(addr, &text[offset..], rvc);
        if info.length == 0 {
            break;
        }
        if let Some(t) = target {
            if t >= desc.text_start && t < desc.text_end {
                desc.mark_jump(t);
            }
        }
        offset += info.length as usize;
    }
}

/// Second pass: emit a patch descriptor for every ecall, with the window of
/// surrounding instructions and the statically carried a7 value.
fn find_ecalls(desc: &mut ObjDesc, text: &[u8], rvc: bool) {
    // instructions preceding the current one, newest last
    let mut history: Vec<InsnInfo> = Vec::with_capacity(SYSCALL_IDX + 1);
    // patches whose trailing window entries are still being filled;
    // (index into desc.patches, next window slot)
    let mut pending: Vec<(usize, usize)> = Vec::new();
    let mut cur_a7: i64 = SYSCALL_NUM_UNKNOWN;

    let mut offset = 0usize;
    while offset < text.len() {
        let addr = desc.text_start + offset;
        let (info, _) = decode(addr, &text[offset..], rvc);
        if info.length == 0 {
            break;
        }

        // the knowledge of the last a7 immediate does not survive register
        // clobbers or jump landings between the load and the ecall
        if info.a7_set > SYSCALL_NUM_UNKNOWN {
            cur_a7 = info.a7_set;
        } else if info.is_a7_modified {
            cur_a7 = SYSCALL_NUM_UNKNOWN;
        }
        if desc.has_jump(addr) {
            cur_a7 = SYSCALL_NUM_UNKNOWN;
        }

        pending.retain(|&(patch_i, slot)| {
            desc.patches[patch_i].window_mut()[slot] = info;
            slot + 1 < SURROUNDING_INSTRS_NUM
        });
        for p in pending.iter_mut() {
            p.1 += 1;
        }

        if info.is_syscall {
            debug!(
                "found ecall at {}:{:#x}",
                desc.path.to_string_lossy(),
                addr - desc.base_addr
            );
            let mut window = vec![InsnInfo::unset(); SURROUNDING_INSTRS_NUM];
            let prefix = history.len().min(SYSCALL_IDX);
            window[SYSCALL_IDX - prefix..SYSCALL_IDX]
                .copy_from_slice(&history[history.len() - prefix..]);
            window[SYSCALL_IDX] = info;
            let patch = PatchDesc::new(addr, addr - desc.base_addr, window, cur_a7);
            desc.patches.push(patch);
            pending.push((desc.patches.len() - 1, SYSCALL_IDX + 1));
        }

        if history.len() == SYSCALL_IDX {
            history.remove(0);
        }
        history.push(info);
        offset += info.length as usize;
    }
}

/// Fill in the text extent and the patch descriptors of one object.
pub fn find_syscalls(desc: &mut ObjDesc, rvc: bool) -> Result<()> {
    let path = desc
        .path
        .to_str()
        .map_err(|e| Error::new(ErrorKind::Other, e))?
        .to_owned();
    let bytes = fs::read(&path)?;
    let elf = Elf::parse(&bytes).map_err(|e| Error::new(ErrorKind::Other, e))?;

    let (lo, hi) = find_text_extent(&elf)?;
    desc.text_start = desc.base_addr + lo;
    desc.text_end = desc.base_addr + hi;

    debug!(
        "{}: text {:#x}..{:#x}",
        path, desc.text_start, desc.text_end
    );

    // The scan reads the text where it is mapped, patching later rewrites
    // the very same bytes.
    let text = unsafe {
        std::slice::from_raw_parts(desc.text_start as *const u8, desc.text_end - desc.text_start)
    };
    build_jump_targets(desc, text, rvc);
    find_ecalls(desc, text, rvc);

    debug!("{}: {} ecall sites", path, desc.patches.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;
    use std::ffi::CString;

    fn test_desc(text_start: usize, len: usize) -> ObjDesc {
        ObjDesc {
            base_addr: text_start,
            path: CString::new("/nonexistent/libtest.so").unwrap(),
            text_start,
            text_end: text_start + len,
            jump_targets: Default::default(),
            patches: Vec::new(),
            trampoline_address: 0,
            uses_trampoline: false,
        }
    }

    fn assemble(words: &[u32]) -> Vec<u8> {
        let mut buf = Vec::new();
        for &w in words {
            encode::push32(&mut buf, w);
        }
        buf
    }

    const ECALL: u32 = 0x0000_0073;

    #[test]
    fn jump_targets_cover_branches_and_jal() {
        let base = 0x10000;
        let text = assemble(&[
            encode::jal(0, base, base + 12),      // j +12
            0x0005_0863,                          // beqz a0, +16
            encode::addi(10, 10, 1),
            encode::addi(10, 10, 1),
            encode::addi(10, 10, 1),
        ]);
        let mut desc = test_desc(base, text.len());
        build_jump_targets(&mut desc, &text, true);
        assert!(desc.has_jump(base + 12));
        assert!(desc.has_jump(base + 4 + 16));
        assert!(!desc.has_jump(base + 8));
    }

    #[test]
    fn ecalls_get_windows_and_carried_a7() {
        let base = 0x10000;
        let text = assemble(&[
            encode::addi(10, 10, 0),
            encode::li(17, 64), // li a7, 64
            encode::addi(11, 11, 0),
            ECALL,
            encode::addi(12, 12, 0),
        ]);
        let mut desc = test_desc(base, text.len());
        build_jump_targets(&mut desc, &text, true);
        find_ecalls(&mut desc, &text, true);

        assert_eq!(desc.patches.len(), 1);
        let p = &desc.patches[0];
        assert_eq!(p.syscall_addr, base + 12);
        assert_eq!(p.syscall_num, 64);
        let w = p.window();
        assert!(w[SYSCALL_IDX].is_syscall);
        assert_eq!(w[SYSCALL_IDX - 1].address, base + 8);
        assert_eq!(w[SYSCALL_IDX + 1].address, base + 16);
        assert!(!w[0].is_set); // window starts before the text
    }

    #[test]
    fn a7_knowledge_is_dropped_on_clobber() {
        let base = 0x10000;
        let text = assemble(&[
            encode::li(17, 64),
            encode::addi(17, 10, 0), // mv a7, a0
            ECALL,
        ]);
        let mut desc = test_desc(base, text.len());
        find_ecalls(&mut desc, &text, true);
        assert_eq!(desc.patches[0].syscall_num, SYSCALL_NUM_UNKNOWN);
    }

    #[test]
    fn a7_knowledge_is_dropped_on_jump_landing() {
        let base = 0x10000;
        let text = assemble(&[
            encode::li(17, 64),
            encode::jal(0, base + 4, base + 8), // j over nothing; lands between load and ecall
            encode::addi(10, 10, 0),
            ECALL,
        ]);
        let mut desc = test_desc(base, text.len());
        build_jump_targets(&mut desc, &text, true);
        find_ecalls(&mut desc, &text, true);
        assert_eq!(desc.patches[0].syscall_num, SYSCALL_NUM_UNKNOWN);
    }

    #[test]
    fn two_ecalls_make_two_patches() {
        let base = 0x10000;
        let text = assemble(&[encode::li(17, 64), ECALL, encode::li(17, 93), ECALL]);
        let mut desc = test_desc(base, text.len());
        find_ecalls(&mut desc, &text, true);
        assert_eq!(desc.patches.len(), 2);
        assert_eq!(desc.patches[0].syscall_num, 64);
        assert_eq!(desc.patches[1].syscall_num, 93);
        // the second ecall appears in the first patch's window
        let w = desc.patches[0].window();
        assert!(w[SYSCALL_IDX + 2].is_syscall);
    }
}
