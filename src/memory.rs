//! Executable memory for compiled code.
//!
//! The compiler itself only produces a byte vector; running the code takes
//! a page-aligned mapping that can be flipped from writable to executable.
//! This module wraps mmap/mprotect for that purpose (W^X: the mapping is
//! never writable and executable at the same time).

use std::ptr::NonNull;

/// Error type for code-page operations.
#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A block of memory for compiled code, writable until
/// [`make_executable`](ExecutableMemory::make_executable) is called.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a writable block of at least `size` bytes, rounded up to
    /// whole pages.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page_size = Self::page_size();
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);
        let ptr = Self::map(aligned_size)?;
        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Map `code` into fresh pages and make them executable.
    pub fn from_code(code: &[u8]) -> Result<Self, MemoryError> {
        let mut mem = Self::new(code.len())?;
        mem.write(0, code)?;
        mem.make_executable()?;
        Ok(mem)
    }

    fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes (page-rounded).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the mapping has been sealed for execution.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy `data` into the mapping at `offset`. Fails once the mapping has
    /// been made executable.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if offset.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::InvalidSize);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Seal the mapping: drop write permission, add execute permission.
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.executable = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        self.executable = true;
        Ok(())
    }

    /// Reinterpret the start of the mapping as a function pointer.
    ///
    /// # Safety
    /// The mapping must contain valid machine code for the host, `F` must be
    /// a function-pointer type matching the code's ABI, and the mapping must
    /// already be executable.
    pub unsafe fn entry<F: Copy>(&self) -> F {
        debug_assert!(self.executable);
        debug_assert_eq!(size_of::<F>(), size_of::<fn()>());
        let ptr = self.ptr.as_ptr();
        unsafe { std::mem::transmute_copy(&ptr) }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        #[cfg(not(unix))]
        {
            let layout = std::alloc::Layout::from_size_align(self.size, Self::page_size())
                .expect("invalid layout");
            unsafe {
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
