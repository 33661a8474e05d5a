//! Zeroed heap buffers for native values

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Owned, zero-initialized, aligned native memory
///
/// Freed on drop.
pub struct RawBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RawBuffer {
    /// Allocate `size` zeroed bytes aligned to `align`. Zero-sized requests
    /// still allocate one byte so the address is unique.
    pub fn zeroed(size: usize, align: usize) -> Self {
        let layout = match Layout::from_size_align(size.max(1), align.max(1).next_power_of_two()) {
            Ok(layout) => layout,
            Err(e) => panic!(
                "invalid native buffer layout ({} bytes, align {}): {}",
                size, align, e
            ),
        };
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Self { ptr, layout }
    }

    /// Copy `size` bytes from `source`
    ///
    /// # Safety
    /// `source` must be valid for reads of `size` bytes.
    pub unsafe fn copy_from(source: *const u8, size: usize, align: usize) -> Self {
        let buffer = Self::zeroed(size, align);
        if size > 0 && !source.is_null() {
            unsafe { std::ptr::copy_nonoverlapping(source, buffer.ptr.as_ptr(), size) };
        }
        buffer
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.layout.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_and_aligned() {
        let buffer = RawBuffer::zeroed(24, 16);
        assert_eq!(buffer.len(), 24);
        assert_eq!(buffer.as_ptr() as usize % 16, 0);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_from() {
        let source = [1u8, 2, 3, 4];
        let buffer = unsafe { RawBuffer::copy_from(source.as_ptr(), 4, 1) };
        assert_eq!(buffer.as_slice(), &source);
        assert_eq!(RawBuffer::zeroed(0, 1).len(), 1);
    }
}
