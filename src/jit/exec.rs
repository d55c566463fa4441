//! Executable memory for JIT output.
//!
//! The emitted byte vector is copied into an anonymous mapping which is then
//! remapped read+execute, so writable and executable are never held at the
//! same time. The buffer owns the mapping and unmaps it on drop.

use std::io;

use crate::jit::JitError;

/// Signature of an entry in the unary math function pointer table handed to
/// emitted code in `rdx`.
pub type MathFn = extern "C" fn(f64) -> f64;

/// Signature of an emitted function: variables pointer, scratch RAM pointer,
/// math function table pointer; result in `xmm0`.
type CompiledFn = unsafe extern "C" fn(*const f64, *mut f64, *const MathFn) -> f64;

/// A page-aligned, executable copy of an emitted code vector.
pub struct ExecutableBuffer {
    ptr: *mut u8,
    len: usize,
    mapped: usize,
}

impl ExecutableBuffer {
    /// Map, copy and seal `code`.
    pub fn new(code: &[u8]) -> Result<Self, JitError> {
        let page = 4096;
        let mapped = (code.len().max(1) + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::ExecutableMemory(io::Error::last_os_error()));
        }
        let ptr = ptr as *mut u8;

        // SAFETY: the mapping is at least `code.len()` bytes and writable.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        // SAFETY: remap the whole mapping read+execute.
        let sealed = unsafe {
            libc::mprotect(
                ptr as *mut libc::c_void,
                mapped,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if sealed != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, mapped);
            }
            return Err(JitError::ExecutableMemory(err));
        }

        Ok(ExecutableBuffer {
            ptr,
            len: code.len(),
            mapped,
        })
    }

    /// Size of the emitted code in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Invoke the code.
    ///
    /// # Safety
    ///
    /// `x` must point at least at as many doubles as the emitted code reads
    /// through `rdi`, `ram` at the call context's full scratch buffer, and
    /// `fns` at the function pointer table the code was compiled against.
    pub unsafe fn call(&self, x: *const f64, ram: *mut f64, fns: *const MathFn) -> f64 {
        let f: CompiledFn = std::mem::transmute(self.ptr);
        f(x, ram, fns)
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`mapped` came from the successful mmap in `new`.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.mapped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::opcodes;

    #[test]
    fn a_trivial_function_round_trips_through_executable_memory() {
        // movsd xmm0, [rdi]; ret — the identity on x[0].
        let mut code = Vec::new();
        opcodes::load_from_memory_by_rdi_offset_to_xmm0(&mut code, 0);
        opcodes::ret(&mut code);
        let buffer = ExecutableBuffer::new(&code).unwrap();
        assert_eq!(buffer.len(), code.len());
        let x = [42.5f64];
        let mut ram = [0.0f64];
        let result = unsafe { buffer.call(x.as_ptr(), ram.as_mut_ptr(), std::ptr::null()) };
        assert_eq!(result, 42.5);
    }
}
