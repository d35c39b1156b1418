//! Output-image access: architecture selection, memory mapping, header
//! validation, and the interrupt cleanup guard.
//!
//! The previously linked binary is mapped shared read-write for the lifetime
//! of the incremental session; every other module works through integer
//! offsets into this buffer.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, Ordering};

use memmap2::MmapMut;
use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::macho::*;

// =============================================================================
// Architecture
// =============================================================================

/// Target architecture of the image being relinked.
///
/// All architecture-dependent constants hang off this type: pointer width,
/// the load-command size alignment mask, and the accepted magic/cputype
/// pair. Once chosen at open time nothing dispatches dynamically. 32-bit
/// targets would plug in here with a pointer width of 4 and a mask of 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// x86_64
    X86_64,
    /// arm64
    Arm64,
}

impl Arch {
    /// The Mach-O magic this architecture's images carry.
    #[inline]
    pub fn magic(self) -> u32 {
        MH_MAGIC_64
    }

    /// The expected cputype.
    #[inline]
    pub fn cputype(self) -> u32 {
        match self {
            Arch::X86_64 => CPU_TYPE_X86_64,
            Arch::Arm64 => CPU_TYPE_ARM64,
        }
    }

    /// Pointer width in bytes.
    #[inline]
    pub fn pointer_size(self) -> u64 {
        8
    }

    /// Load-command sizes must be aligned by this mask.
    #[inline]
    pub fn load_command_size_mask(self) -> u32 {
        7
    }

    /// Human-readable architecture name.
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
        }
    }

    /// Parses an architecture name as given on a command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x86_64" => Some(Arch::X86_64),
            "arm64" | "aarch64" => Some(Arch::Arm64),
            _ => None,
        }
    }
}

// =============================================================================
// Interrupt Cleanup Guard
// =============================================================================

// Path unlinked by the SIGINT handler. Written only while a session is open;
// the process-wide single-session invariant makes the swap race-free in
// practice.
static CLEANUP_PATH: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn remove_output_and_exit(_sig: libc::c_int) {
    // Signal handler: only async-signal-safe calls.
    let path = CLEANUP_PATH.load(Ordering::SeqCst);
    unsafe {
        if !path.is_null() {
            libc::unlink(path);
        }
        let msg = b"relink: interrupted\n";
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::_exit(1);
    }
}

fn install_cleanup_handler(path: &Path) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::unsupported("output path contains NUL"))?;
    let prev = CLEANUP_PATH.swap(cpath.into_raw(), Ordering::SeqCst);
    if !prev.is_null() {
        // Restore the old pointer; a second session must not steal the guard.
        let stolen = CLEANUP_PATH.swap(prev, Ordering::SeqCst);
        unsafe { drop(CString::from_raw(stolen)) };
        return Err(Error::InvalidState {
            reason: "an incremental session is already open in this process",
        });
    }
    unsafe {
        libc::signal(libc::SIGINT, remove_output_and_exit as libc::sighandler_t);
    }
    Ok(())
}

fn uninstall_cleanup_handler() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
    let path = CLEANUP_PATH.swap(std::ptr::null_mut(), Ordering::SeqCst);
    if !path.is_null() {
        unsafe { drop(CString::from_raw(path)) };
    }
}

// =============================================================================
// Volume Probing
// =============================================================================

/// Returns true if the volume holding `path` supports shared writable
/// mappings. Only hfs and apfs qualify on macOS; every other platform this
/// crate builds on maps regular files fine.
#[cfg(target_os = "macos")]
fn volume_is_mappable(path: &Path) -> bool {
    use std::mem::MaybeUninit;

    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mut info = MaybeUninit::<libc::statfs>::uninit();
    if unsafe { libc::statfs(cpath.as_ptr(), info.as_mut_ptr()) } != 0 {
        return false;
    }
    let info = unsafe { info.assume_init() };
    let end = info
        .f_fstypename
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(info.f_fstypename.len());
    let name: Vec<u8> = info.f_fstypename[..end].iter().map(|&c| c as u8).collect();
    name == b"hfs" || name == b"apfs"
}

#[cfg(not(target_os = "macos"))]
fn volume_is_mappable(_path: &Path) -> bool {
    true
}

// =============================================================================
// Image Buffer
// =============================================================================

#[derive(Debug)]
enum Backing {
    /// Shared read-write mapping of the output file.
    Mapped { map: MmapMut, _file: std::fs::File },
    /// Owned bytes, used by tests and in-memory callers.
    Owned(Vec<u8>),
}

/// The mapped bytes of a previously produced binary.
///
/// Owned by the facade for the lifetime of the session. Writes go straight
/// into the shared mapping; there is no separate dirty copy.
#[derive(Debug)]
pub struct ImageBuffer {
    backing: Backing,
    path: Option<PathBuf>,
}

impl ImageBuffer {
    /// Opens and maps the output image read-write.
    ///
    /// The path must be a regular file on a mappable volume. A SIGINT
    /// arriving while the session is open unlinks the output and exits
    /// immediately; a half-patched image is never left behind under a valid
    /// name.
    pub fn open(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| Error::io(path, e))?;
        if !metadata.is_file() {
            return Err(Error::unsupported("output is not a regular file"));
        }
        if !volume_is_mappable(path) {
            return Err(Error::unsupported(
                "output volume does not support shared mappings",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        install_cleanup_handler(path)?;

        let map = match unsafe { MmapMut::map_mut(&file) } {
            Ok(map) => map,
            Err(e) => {
                uninstall_cleanup_handler();
                return Err(Error::io(path, e));
            }
        };

        Ok(Self {
            backing: Backing::Mapped { map, _file: file },
            path: Some(path.to_path_buf()),
        })
    }

    /// Wraps owned bytes as an image buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(data),
            path: None,
        }
    }

    /// Length of the image in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns true if the image is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The whole image.
    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped { map, .. } => map,
            Backing::Owned(data) => data,
        }
    }

    /// The whole image, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Mapped { map, .. } => map,
            Backing::Owned(data) => data,
        }
    }

    /// The output path, when file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flushes dirty pages and releases the mapping.
    pub fn close(self) -> Result<()> {
        if let Backing::Mapped { map, .. } = &self.backing {
            if let Err(e) = map.flush() {
                let path = self.path.clone().unwrap_or_default();
                return Err(Error::io(path, e));
            }
        }
        Ok(())
        // Drop unmaps and uninstalls the guard.
    }
}

impl Drop for ImageBuffer {
    fn drop(&mut self) {
        if matches!(self.backing, Backing::Mapped { .. }) {
            uninstall_cleanup_handler();
        }
    }
}

// =============================================================================
// Header Validation
// =============================================================================

/// Validates the Mach-O header against the configured architecture.
///
/// Rejects wrong magic/cputype, file types a linker output can never be,
/// command sizes larger than the file, and forbidden flag bits.
pub fn validate_header(data: &[u8], arch: Arch) -> Result<MachHeader64> {
    if data.len() < MachHeader64::SIZE {
        return Err(Error::malformed(0, "file smaller than mach_header"));
    }
    let header = MachHeader64::read_from_prefix(data)
        .map_err(|_| Error::malformed(0, "unreadable mach_header"))?
        .0;

    if header.magic != arch.magic() {
        return Err(Error::unsupported(format!(
            "bad magic {:#x}, not a 64-bit mach-o",
            header.magic
        )));
    }
    if header.cputype != arch.cputype() {
        return Err(Error::ArchMismatch {
            expected: arch.name(),
            found: header.cputype,
        });
    }
    if !header.is_linkable_output() {
        return Err(Error::unsupported(format!(
            "file type {:#x} is not a linker output",
            header.filetype
        )));
    }
    if MachHeader64::SIZE + header.sizeofcmds as usize > data.len() {
        return Err(Error::malformed(
            0,
            "sizeofcmds in mach_header is larger than file",
        ));
    }
    if header.flags & MH_INVALID_FLAG_BITS != 0 {
        return Err(Error::unsupported("invalid bits in mach_header flags"));
    }
    if header.flag_bits().contains(MachOFlags::NO_REEXPORTED_DYLIBS) && !header.is_dylib() {
        return Err(Error::unsupported(
            "MH_NO_REEXPORTED_DYLIBS flag only valid for dylibs",
        ));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn header_bytes(header: MachHeader64) -> Vec<u8> {
        let mut data = vec![0u8; 0x100];
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        data
    }

    fn exec_header() -> MachHeader64 {
        MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64_ALL,
            filetype: MH_EXECUTE,
            ncmds: 0,
            sizeofcmds: 0,
            flags: MachOFlags::NOUNDEFS.bits() | MachOFlags::PIE.bits(),
            reserved: 0,
        }
    }

    #[test]
    fn test_accepts_valid_executable() {
        let data = header_bytes(exec_header());
        let header = validate_header(&data, Arch::Arm64).unwrap();
        assert_eq!(header.filetype, MH_EXECUTE);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut h = exec_header();
        h.magic = 0xDEADBEEF;
        assert!(matches!(
            validate_header(&header_bytes(h), Arch::Arm64),
            Err(Error::UnsupportedImage { .. })
        ));
    }

    #[test]
    fn test_rejects_wrong_cputype() {
        let h = exec_header();
        assert!(matches!(
            validate_header(&header_bytes(h), Arch::X86_64),
            Err(Error::ArchMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_object_file() {
        let mut h = exec_header();
        h.filetype = MH_OBJECT;
        assert!(matches!(
            validate_header(&header_bytes(h), Arch::Arm64),
            Err(Error::UnsupportedImage { .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_commands() {
        let mut h = exec_header();
        h.sizeofcmds = 0x10000;
        assert!(matches!(
            validate_header(&header_bytes(h), Arch::Arm64),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_rejects_incrlink_flag() {
        let mut h = exec_header();
        h.flags |= MachOFlags::INCRLINK.bits();
        assert!(matches!(
            validate_header(&header_bytes(h), Arch::Arm64),
            Err(Error::UnsupportedImage { .. })
        ));
    }

    #[test]
    fn test_rejects_top_nibble_flags() {
        let mut h = exec_header();
        h.flags |= 0x8000_0000;
        assert!(validate_header(&header_bytes(h), Arch::Arm64).is_err());
    }

    #[test]
    fn test_rejects_no_reexport_on_executable() {
        let mut h = exec_header();
        h.flags |= MachOFlags::NO_REEXPORTED_DYLIBS.bits();
        assert!(matches!(
            validate_header(&header_bytes(h), Arch::Arm64),
            Err(Error::UnsupportedImage { .. })
        ));
    }

    #[test]
    fn test_owned_buffer_roundtrip() {
        let mut buf = ImageBuffer::from_vec(vec![0u8; 64]);
        buf.as_mut_slice()[10] = 0xAB;
        assert_eq!(buf.as_slice()[10], 0xAB);
        assert_eq!(buf.len(), 64);
        buf.close().unwrap();
    }
}
