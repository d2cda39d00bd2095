//! Enumerating the loaded objects and deciding which ones to patch.

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::path::PathBuf;

use log::debug;

use crate::patch::PatchDesc;
use crate::util::xabort;

/// Everything collected about one object selected for patching.
pub struct ObjDesc {
    pub base_addr: usize,
    pub path: CString,
    pub text_start: usize,
    pub text_end: usize,
    /// addresses some branch or jump in this object lands on; patches must
    /// not cover them (except as their first instruction)
    pub jump_targets: HashSet<usize>,
    pub patches: Vec<PatchDesc>,
    pub trampoline_address: usize,
    pub uses_trampoline: bool,
}

impl ObjDesc {
    fn new(base_addr: usize, path: CString) -> Self {
        ObjDesc {
            base_addr,
            path,
            text_start: 0,
            text_end: 0,
            jump_targets: HashSet::new(),
            patches: Vec::new(),
            trampoline_address: 0,
            uses_trampoline: false,
        }
    }

    pub fn has_jump(&self, addr: usize) -> bool {
        self.jump_targets.contains(&addr)
    }

    /// Record an address execution may land on. Used for real jump targets
    /// and for the first byte past each placed patch, which keeps later
    /// patches from overlapping earlier ones.
    pub fn mark_jump(&mut self, addr: usize) {
        self.jump_targets.insert(addr);
    }
}

struct EnumState {
    objs: Vec<ObjDesc>,
    libc_found: bool,
    patch_all_objs: bool,
    vdso_addr: usize,
    self_addr: usize,
    rvc: bool,
}

/// find filename in a path containing directories
fn get_lib_short_name(name: &CStr) -> &[u8] {
    let bytes = name.to_bytes();
    let base = match bytes.iter().rposition(|&c| c == b'/') {
        Some(i) => &bytes[i + 1..],
        None => bytes,
    };
    let len = base
        .iter()
        .position(|&c| c == b'-' || c == b'.')
        .unwrap_or(base.len());
    &base[..len]
}

/// Find a virtual address expected to be in use by the object: the first
/// loadable segment with a non-zero memory size.
unsafe fn get_any_used_vaddr(info: &libc::dl_phdr_info) -> usize {
    let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    for ph in phdrs {
        if ph.p_type == libc::PT_LOAD && ph.p_memsz != 0 {
            return info.dlpi_addr as usize + ph.p_vaddr as usize;
        }
    }
    0
}

/// The loader does not always supply an object's name; fall back to the
/// mapping that contains one of its loadable addresses.
fn get_name_from_proc_maps(addr: usize) -> Option<CString> {
    let maps = procfs::process::Process::myself()
        .and_then(|p| p.maps())
        .ok()?;
    for map in maps {
        if (map.address.0 as usize) <= addr && addr < map.address.1 as usize {
            if let procfs::process::MMapPath::Path(p) = map.pathname {
                return path_to_cstring(&p);
            }
            return None;
        }
    }
    None
}

fn path_to_cstring(path: &PathBuf) -> Option<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).ok()
}

unsafe fn get_object_path(info: &libc::dl_phdr_info) -> Option<CString> {
    if !info.dlpi_name.is_null() && *info.dlpi_name != 0 {
        return Some(CStr::from_ptr(info.dlpi_name).to_owned());
    }
    let addr = get_any_used_vaddr(info);
    if addr == 0 {
        return None;
    }
    get_name_from_proc_maps(addr)
}

fn is_vdso(addr: usize, path: &CStr, vdso_addr: usize) -> bool {
    addr == vdso_addr || find_subslice(path.to_bytes(), b"vdso")
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Whether a loaded object is a hotpatching target. The vdso and this
/// library itself (which carries its own disassembler) are always skipped;
/// beyond that only libc and libpthread are patched unless
/// INTERCEPT_ALL_OBJS asks for everything.
fn should_patch_object(state: &mut EnumState, addr: usize, path: &CStr) -> bool {
    if is_vdso(addr, path, state.vdso_addr) {
        debug!(" - skipping: is_vdso");
        return false;
    }

    let name = get_lib_short_name(path);
    if name.is_empty() {
        return false;
    }

    if addr == state.self_addr {
        debug!(" - skipping: matches self");
        return false;
    }

    if name == b"libc" {
        debug!(" - libc found");
        state.libc_found = true;
        return true;
    }

    if state.patch_all_objs {
        return true;
    }

    if name == b"libpthread" {
        debug!(" - libpthread found");
        return true;
    }

    debug!(" - skipping, INTERCEPT_ALL_OBJS not set");
    false
}

unsafe extern "C" fn analyze_object(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let state = &mut *(data as *mut EnumState);
    let info = &*info;

    debug!(
        "analyze_object called on \"{}\" at {:#018x}",
        if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        },
        info.dlpi_addr
    );

    let path = match get_object_path(info) {
        Some(p) => p,
        None => return 0,
    };

    debug!("analyze {}", path.to_string_lossy());

    if !should_patch_object(state, info.dlpi_addr as usize, &path) {
        return 0;
    }

    let mut desc = ObjDesc::new(info.dlpi_addr as usize, path);
    if let Err(e) = crate::scan::find_syscalls(&mut desc, state.rvc) {
        xabort(&format!(
            "cannot analyze {}: {}",
            desc.path.to_string_lossy(),
            e
        ));
    }
    state.objs.push(desc);
    0
}

/// Walk the loader's object list and scan every selected object. Aborts
/// when libc is nowhere to be found, since the library would then serve no
/// purpose.
pub fn discover_objects(patch_all_objs: bool, rvc: bool, self_addr: usize) -> Vec<ObjDesc> {
    let vdso_addr = unsafe { libc::getauxval(libc::AT_SYSINFO_EHDR) as usize };

    let mut state = EnumState {
        objs: Vec::new(),
        libc_found: false,
        patch_all_objs,
        vdso_addr,
        self_addr,
        rvc,
    };

    unsafe {
        libc::dl_iterate_phdr(Some(analyze_object), &mut state as *mut EnumState as *mut c_void);
    }

    if !state.libc_found {
        xabort("libc not found");
    }

    state.objs
}

/// Base address of the object containing `addr`, for self-detection.
pub fn object_base_of(addr: usize) -> usize {
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(addr as *const c_void, &mut info) == 0 {
            xabort("self dladdr failure");
        }
        info.dli_fbase as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cstr(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn short_names_truncate_at_dash_and_dot() {
        assert_eq!(get_lib_short_name(&cstr("/usr/lib/libc-2.25.so")), b"libc");
        assert_eq!(get_lib_short_name(&cstr("/usr/lib/libc.so.6")), b"libc");
        assert_eq!(
            get_lib_short_name(&cstr("/lib/libpthread.so.0")),
            b"libpthread"
        );
        assert_eq!(get_lib_short_name(&cstr("noslash.so")), b"noslash");
        assert_eq!(get_lib_short_name(&cstr("/trailing/")), b"");
    }

    #[test]
    fn vdso_is_recognized_by_name_or_address() {
        assert!(is_vdso(0x1000, &cstr("whatever"), 0x1000));
        assert!(is_vdso(0x2000, &cstr("linux-vdso.so.1"), 0x1000));
        assert!(!is_vdso(0x2000, &cstr("/usr/lib/libc.so.6"), 0x1000));
    }

    #[test]
    fn proc_maps_resolves_own_mappings() {
        // the test binary itself must be resolvable through /proc/self/maps
        let addr = proc_maps_resolves_own_mappings as usize;
        let path = get_name_from_proc_maps(addr);
        assert!(path.is_some());
    }
}
