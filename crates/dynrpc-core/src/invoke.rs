//! Service function tables and the foreign call itself.
//!
//! [`call`] is the only place in the crate that jumps into native code. It
//! builds a libffi call interface from the method descriptor and hands it an
//! array of argument pointers prepared by the dispatcher.

#![allow(unsafe_code)]

use crate::descriptor::{DynType, MethodDescriptor, Primitive};
use crate::error::{DynRpcError, Result};
use libffi::middle::{Cif, CodePtr, Type};
use std::ffi::c_void;
use std::os::raw::c_int;
use tracing::debug;

/// Address of a native function with a C calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeFn(*const c_void);

impl NativeFn {
    /// Wrap a function address. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// `ptr` must be the address of an `extern "C"` function whose signature
    /// matches the descriptor of every method it is registered under.
    pub unsafe fn from_ptr(ptr: *const c_void) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self(ptr))
        }
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0
    }
}

/// One service instance as supplied by the component model: an opaque handle
/// plus its functions, indexed by `MethodDescriptor::index`.
#[derive(Debug)]
pub struct ServiceTable {
    handle: *mut c_void,
    methods: Vec<NativeFn>,
}

// SAFETY: the table is never mutated after construction. The handle and the
// functions belong to the component model, which owns the thread safety of the
// service behind them.
unsafe impl Send for ServiceTable {}
unsafe impl Sync for ServiceTable {}

impl ServiceTable {
    pub fn new(handle: *mut c_void, methods: Vec<NativeFn>) -> Self {
        Self { handle, methods }
    }

    /// Read a C service struct laid out as
    /// `struct { void *handle; void (*methods[])(void); }`.
    ///
    /// # Safety
    ///
    /// `service` must point at such a struct holding at least `count`
    /// function pointers, each satisfying [`NativeFn::from_ptr`].
    pub unsafe fn from_c_layout(service: *const c_void, count: usize) -> Result<Self> {
        let words = service.cast::<*const c_void>();
        // SAFETY: the first word of the layout is the handle.
        let handle = unsafe { words.read() }.cast_mut();
        let mut methods = Vec::with_capacity(count);
        for index in 0..count {
            // SAFETY: the caller guarantees `count` function pointers follow the handle.
            let function = unsafe { NativeFn::from_ptr(words.add(1 + index).read()) }
                .ok_or(DynRpcError::MissingFunction { index, len: count })?;
            methods.push(function);
        }
        Ok(Self::new(handle, methods))
    }

    pub fn handle(&self) -> *mut c_void {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Function registered at `index`.
    pub fn function(&self, index: usize) -> Result<NativeFn> {
        self.methods
            .get(index)
            .copied()
            .ok_or(DynRpcError::MissingFunction {
                index,
                len: self.methods.len(),
            })
    }
}

fn ffi_type(ty: &DynType) -> Type {
    match ty {
        DynType::Void => Type::void(),
        DynType::Primitive(p) => match p {
            Primitive::Bool | Primitive::U8 => Type::u8(),
            Primitive::I8 => Type::i8(),
            Primitive::I16 => Type::i16(),
            Primitive::U16 => Type::u16(),
            Primitive::I32 => Type::i32(),
            Primitive::U32 => Type::u32(),
            Primitive::I64 => Type::i64(),
            Primitive::U64 => Type::u64(),
            Primitive::F32 => Type::f32(),
            Primitive::F64 => Type::f64(),
            Primitive::NativeInt => match std::mem::size_of::<c_int>() {
                2 => Type::i16(),
                8 => Type::i64(),
                _ => Type::i32(),
            },
        },
        DynType::Text | DynType::Untyped | DynType::Pointer(_) => Type::pointer(),
        DynType::Sequence(_) => Type::structure(vec![Type::u32(), Type::u32(), Type::pointer()]),
        DynType::Struct(s) => {
            Type::structure(s.fields().iter().map(|f| ffi_type(f.ty())).collect::<Vec<_>>())
        }
    }
}

/// Call `function` with the C signature described by `method` and return the
/// native status it produced.
///
/// `slots[i]` points at the value of argument `i`, exactly as libffi expects:
/// a pointer to a `double` for a `D` argument, a pointer to a `double*` for a
/// `*D` argument, and so on.
///
/// # Safety
///
/// `function` must have the signature described by `method`, `method` must
/// return `N`, and every slot must point at a live value of its argument type
/// for the duration of the call.
pub unsafe fn call(method: &MethodDescriptor, function: NativeFn, slots: &mut [*mut c_void]) -> c_int {
    debug_assert_eq!(slots.len(), method.arguments().len());
    debug_assert!(method.return_type().is_native_int());

    let arg_types: Vec<Type> = method.arguments().iter().map(|a| ffi_type(a.ty())).collect();
    let cif = Cif::new(arg_types, ffi_type(method.return_type()));
    let code = CodePtr::from_ptr(function.as_ptr());

    // libffi widens integral returns to a full `ffi_arg`; i64 covers it on
    // every supported target.
    let mut status: i64 = 0;

    debug!(
        "Calling native '{}' with {} arguments",
        method.name(),
        slots.len()
    );
    // SAFETY: guaranteed by the caller; `status` outlives the call.
    unsafe {
        libffi::raw::ffi_call(
            cif.as_raw_ptr(),
            Some(*code.as_fun()),
            (&mut status as *mut i64).cast(),
            slots.as_mut_ptr(),
        );
    }
    status as c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TypeRegistry;
    use std::ptr;

    extern "C" fn scale(handle: *mut c_void, value: f64, factor: i32, out: *mut f64) -> c_int {
        if handle.is_null() || out.is_null() {
            return 2;
        }
        // SAFETY: the test passes a valid f64 slot.
        unsafe { out.write(value * f64::from(factor)) };
        0
    }

    extern "C" fn fail(_handle: *mut c_void) -> c_int {
        -7
    }

    #[test]
    fn test_call_passes_arguments_by_value_and_pointer() {
        let method = MethodDescriptor::parse(
            "scale(DI)D",
            0,
            "scale(#am=handle;PDI#am=pre;*D)N",
            &TypeRegistry::new(),
        )
        .unwrap();
        // SAFETY: `scale` matches the descriptor.
        let function = unsafe { NativeFn::from_ptr(scale as *const c_void) }.unwrap();

        let mut handle_value = 1usize;
        let mut handle: *mut c_void = (&mut handle_value as *mut usize).cast();
        let mut value = 1.5f64;
        let mut factor = 4i32;
        let mut result = 0f64;
        let mut result_ptr: *mut f64 = &mut result;

        let mut slots: Vec<*mut c_void> = vec![
            (&mut handle as *mut *mut c_void).cast(),
            (&mut value as *mut f64).cast(),
            (&mut factor as *mut i32).cast(),
            (&mut result_ptr as *mut *mut f64).cast(),
        ];
        // SAFETY: every slot points at a live value of its argument type.
        let status = unsafe { call(&method, function, &mut slots) };

        assert_eq!(status, 0);
        assert_eq!(result, 6.0);
    }

    #[test]
    fn test_call_returns_negative_status() {
        let method =
            MethodDescriptor::parse("fail()N", 0, "fail(#am=handle;P)N", &TypeRegistry::new())
                .unwrap();
        // SAFETY: `fail` matches the descriptor.
        let function = unsafe { NativeFn::from_ptr(fail as *const c_void) }.unwrap();
        let mut handle: *mut c_void = ptr::null_mut();
        let mut slots: Vec<*mut c_void> = vec![(&mut handle as *mut *mut c_void).cast()];

        // SAFETY: the only slot points at a handle.
        let status = unsafe { call(&method, function, &mut slots) };
        assert_eq!(status, -7);
    }

    #[test]
    fn test_service_table_lookup() {
        // SAFETY: only the address is compared.
        let function = unsafe { NativeFn::from_ptr(fail as *const c_void) }.unwrap();
        let table = ServiceTable::new(ptr::null_mut(), vec![function]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.function(0).unwrap(), function);
        assert!(matches!(
            table.function(3),
            Err(DynRpcError::MissingFunction { index: 3, len: 1 })
        ));
        // SAFETY: null is rejected before anything is called.
        assert!(unsafe { NativeFn::from_ptr(ptr::null()) }.is_none());
    }

    #[test]
    fn test_from_c_layout() {
        #[repr(C)]
        struct Layout {
            handle: *mut c_void,
            methods: [*const c_void; 2],
        }
        let mut state = 42u32;
        let layout = Layout {
            handle: (&mut state as *mut u32).cast(),
            methods: [scale as *const c_void, fail as *const c_void],
        };

        // SAFETY: `layout` matches the C service layout with two functions.
        let table =
            unsafe { ServiceTable::from_c_layout((&layout as *const Layout).cast(), 2) }.unwrap();
        assert_eq!(table.handle(), layout.handle);
        assert_eq!(table.function(1).unwrap().as_ptr(), fail as *const c_void);

        let broken = Layout {
            handle: ptr::null_mut(),
            methods: [scale as *const c_void, ptr::null()],
        };
        // SAFETY: as above; the null entry is reported, not called.
        let result = unsafe { ServiceTable::from_c_layout((&broken as *const Layout).cast(), 2) };
        assert!(result.is_err());
    }
}
