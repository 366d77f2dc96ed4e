//! Zeroing and pinning of key-bearing buffers.
//!
//! Every symmetric key in this crate lives in a [`KeyBuffer`]: a fixed-size,
//! heap-allocated array that is pinned with `mlock` on Unix for as long as it
//! exists, and whose release path always overwrites it with zeros first.
//!
//! # Limitations
//!
//! Pinning is best-effort. If `mlock` fails (for example because
//! `RLIMIT_MEMLOCK` is exhausted) the buffer still works and is still scrubbed,
//! but may be swapped. Nothing here can scrub copies that reached swap before
//! pinning took effect, or copies made by the allocator or the kernel.

use crate::constants::{KEY_LEN, REDACTED_PLACEHOLDER};
use std::fmt;
use tracing::warn;
use zeroize::Zeroize;

/// Overwrites every byte of `buffer` with zero.
///
/// Uses volatile writes via `zeroize` so the compiler cannot elide the store.
pub fn scrub(buffer: &mut [u8]) {
    buffer.zeroize();
}

/// A fixed-size pinned buffer holding one 256-bit key.
pub struct KeyBuffer {
    bytes: Box<[u8; KEY_LEN]>,
    pinned: bool,
}

impl KeyBuffer {
    /// Allocates a zero-filled buffer and tries to pin it.
    pub fn new() -> Self {
        let bytes = Box::new([0u8; KEY_LEN]);
        let pinned = pin(bytes.as_ptr(), KEY_LEN);
        if !pinned {
            warn!("Could not pin key buffer; key material may be swapped to disk");
        }
        Self { bytes, pinned }
    }

    /// Read access for cipher construction.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Write access for derivation and unwrapping, which fill the buffer in place.
    pub fn as_mut_bytes(&mut self) -> &mut [u8; KEY_LEN] {
        &mut self.bytes
    }

    /// Replaces the contents with `other`, scrubbing the previous key first.
    pub fn copy_from(&mut self, other: &KeyBuffer) {
        self.scrub();
        self.bytes.copy_from_slice(other.as_bytes());
    }

    /// Fills the buffer from the operating system random source.
    pub fn randomize(&mut self) -> Result<(), getrandom::Error> {
        getrandom::getrandom(self.bytes.as_mut_slice())
    }

    /// Zeroes the key in place. The allocation stays pinned.
    pub fn scrub(&mut self) {
        scrub(self.bytes.as_mut_slice());
    }

    /// Returns `true` when every byte is zero.
    pub fn is_zeroed(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Whether `mlock` succeeded for this buffer.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

impl Default for KeyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KeyBuffer {
    fn drop(&mut self) {
        self.scrub();
        if self.pinned {
            unpin(self.bytes.as_ptr(), KEY_LEN);
        }
    }
}

impl fmt::Debug for KeyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBuffer")
            .field("bytes", &REDACTED_PLACEHOLDER)
            .field("pinned", &self.pinned)
            .finish()
    }
}

#[cfg(unix)]
fn pin(ptr: *const u8, len: usize) -> bool {
    // SAFETY: `ptr` points to a live allocation of at least `len` bytes owned by
    // the caller; mlock does not read or write the memory.
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(unix)]
fn unpin(ptr: *const u8, len: usize) {
    // SAFETY: same allocation that was passed to `pin`, still live.
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn pin(_ptr: *const u8, _len: usize) -> bool {
    false
}

#[cfg(not(unix))]
fn unpin(_ptr: *const u8, _len: usize) {}
