//! Native memory crossing the call boundary.
//!
//! Every block handed to or received from a native function is allocated with
//! the C allocator (`calloc`/`free`), so C services can allocate output values
//! with `malloc` and the marshaller can release them, and vice versa.
//!
//! # Accounting
//!
//! Allocations and releases made through this module are counted per thread.
//! A call runs start to finish on one thread, so comparing
//! [`live_allocations`] before and after a call shows whether every block it
//! allocated was released exactly once. Blocks a callee obtains from plain
//! `malloc` are only seen when they are released.

#![allow(unsafe_code)]

use crate::descriptor::DynType;
use crate::error::{DynRpcError, Result};
use std::cell::Cell;
use std::fmt;
use std::ptr::{self, NonNull};

/// In-memory representation of a `[` sequence.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSequence {
    pub cap: u32,
    pub len: u32,
    pub buf: *mut u8,
}

thread_local! {
    static LIVE_ALLOCATIONS: Cell<isize> = const { Cell::new(0) };
}

fn track(delta: isize) {
    LIVE_ALLOCATIONS.with(|live| live.set(live.get() + delta));
}

/// Number of blocks allocated on this thread and not yet released.
pub fn live_allocations() -> isize {
    LIVE_ALLOCATIONS.with(|live| live.get())
}

/// Allocate `size` zeroed bytes with the C allocator.
///
/// A zero `size` still yields a unique, freeable block.
pub fn alloc_zeroed(size: usize) -> Result<NonNull<u8>> {
    // SAFETY: calloc has no preconditions; the result is checked for null.
    let raw = unsafe { libc::calloc(1, size.max(1)) }.cast::<u8>();
    let block = NonNull::new(raw).ok_or(DynRpcError::Allocation { size })?;
    track(1);
    Ok(block)
}

/// Copy `text` into a new NUL-terminated C string.
pub fn alloc_text(text: &str) -> Result<NonNull<u8>> {
    if text.as_bytes().contains(&0) {
        return Err(DynRpcError::codec("t", "text contains an interior NUL byte"));
    }
    let block = alloc_zeroed(text.len() + 1)?;
    // SAFETY: the block holds text.len() + 1 bytes and cannot overlap `text`.
    unsafe { ptr::copy_nonoverlapping(text.as_ptr(), block.as_ptr(), text.len()) };
    Ok(block)
}

/// Release a block from the C allocator. Null is ignored.
///
/// # Safety
///
/// `block` must be null or a live block from the C allocator that is not used
/// afterwards.
pub unsafe fn free(block: *mut u8) {
    if block.is_null() {
        return;
    }
    // SAFETY: guaranteed by the caller.
    unsafe { libc::free(block.cast()) };
    track(-1);
}

/// Release everything an instance of `ty` at `value` owns, leaving the block
/// holding the instance itself allocated.
///
/// Zeroed (null) pointers are skipped, so a partially initialised instance
/// is released correctly.
///
/// # Safety
///
/// `value` must point at a valid, possibly zeroed, instance of `ty` whose
/// nested blocks came from the C allocator and are owned by the instance.
pub unsafe fn free_contents(ty: &DynType, value: *mut u8) {
    match ty {
        DynType::Void | DynType::Primitive(_) | DynType::Untyped => {}
        DynType::Text => {
            // SAFETY: a text value is a single char pointer it owns.
            unsafe { free(value.cast::<*mut u8>().read()) }
        }
        DynType::Pointer(inner) => {
            // SAFETY: a typed pointer owns its target, itself an instance of `inner`.
            let target = unsafe { value.cast::<*mut u8>().read() };
            if let Some(target) = NonNull::new(target) {
                // SAFETY: as above; the target is released when the value drops.
                drop(unsafe { NativeValue::from_raw(inner, target) });
            }
        }
        DynType::Struct(s) => {
            for field in s.fields() {
                // SAFETY: field offsets lie inside the struct layout.
                unsafe { free_contents(field.ty(), value.add(field.offset())) }
            }
        }
        DynType::Sequence(element) => {
            // SAFETY: the first `len` elements of `buf` are instances of `element`.
            unsafe {
                let seq = value.cast::<RawSequence>().read();
                if !seq.buf.is_null() {
                    let stride = element.size();
                    for i in 0..seq.len as usize {
                        free_contents(element, seq.buf.add(i * stride));
                    }
                    free(seq.buf);
                }
            }
        }
    }
}

/// An owned native instance of a descriptor type.
///
/// Dropping the value releases everything it owns and then its own block,
/// which is how every argument slot of a call is guaranteed to be released
/// exactly once on every exit path.
pub struct NativeValue<'t> {
    ty: &'t DynType,
    block: NonNull<u8>,
}

impl<'t> NativeValue<'t> {
    /// Allocate a zeroed instance of `ty`.
    pub fn alloc(ty: &'t DynType) -> Result<Self> {
        let block = alloc_zeroed(ty.size())?;
        Ok(Self { ty, block })
    }

    /// Take ownership of an instance the caller allocated.
    ///
    /// # Safety
    ///
    /// `block` must come from the C allocator, hold a valid instance of `ty`
    /// and not be owned by anything else.
    pub unsafe fn from_raw(ty: &'t DynType, block: NonNull<u8>) -> Self {
        Self { ty, block }
    }

    pub fn ty(&self) -> &'t DynType {
        self.ty
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.block.as_ptr()
    }

    /// Give up ownership without releasing anything.
    pub fn into_raw(self) -> NonNull<u8> {
        let block = self.block;
        std::mem::forget(self);
        block
    }

    /// The pointer stored in a pointer-kind value, or `None` for other types.
    pub fn read_pointer(&self) -> Option<*mut u8> {
        if !self.ty.is_pointer() {
            return None;
        }
        // SAFETY: pointer-kind instances are exactly one pointer wide.
        Some(unsafe { self.block.as_ptr().cast::<*mut u8>().read() })
    }

    /// True when this is a pointer-kind value holding null.
    pub fn is_null_pointer(&self) -> bool {
        self.read_pointer().is_some_and(|target| target.is_null())
    }

    /// Copy the instance into `dest` and release only this value's own block.
    ///
    /// Nested allocations (text, pointer targets, sequence buffers) now belong
    /// to `dest`.
    ///
    /// # Safety
    ///
    /// `dest` must be valid for writes of `ty.size()` bytes and must not
    /// overlap this value. Whatever `dest` held before is overwritten without
    /// being released.
    pub unsafe fn move_into(self, dest: *mut u8) {
        let size = self.ty.size();
        let block = self.into_raw();
        // SAFETY: guaranteed by the caller; `block` holds `size` bytes.
        unsafe {
            ptr::copy_nonoverlapping(block.as_ptr(), dest, size);
            free(block.as_ptr());
        }
    }
}

impl Drop for NativeValue<'_> {
    fn drop(&mut self) {
        // SAFETY: the value exclusively owns its block and everything reachable from it.
        unsafe {
            free_contents(self.ty, self.block.as_ptr());
            free(self.block.as_ptr());
        }
    }
}

impl fmt::Debug for NativeValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeValue")
            .field("ty", &self.ty.to_string())
            .field("block", &self.block)
            .finish()
    }
}
