//! Built-in calculator service used by `serve-demo`.
//!
//! The functions are plain `extern "C"` functions, reached only through the
//! marshaller. `stats` allocates its output with `calloc`, the way a C
//! service would.

#![allow(unsafe_code)]

use dynrpc_core::native::RawSequence;
use dynrpc_core::{InterfaceDescriptor, NativeFn, ServiceTable};
use std::ffi::c_void;
use std::os::raw::c_int;

pub const DESCRIPTOR: &str = "\
:header
type=interface
name=calculator
version=1.0.0
:annotations
classname=org.example.Calculator
:types
StatsResult={DDD average min max}
:methods
add(DD)D=add(#am=handle;PDD#am=pre;*D)N
sub(DD)D=sub(#am=handle;PDD#am=pre;*D)N
sqrt(D)D=sqrt(#am=handle;PD#am=pre;*D)N
stats([D)LStatsResult;=stats(#am=handle;P[D#am=out;**LStatsResult;)N
";

/// Status for a domain error (negative square root, empty input).
const STATUS_DOMAIN: c_int = 1;
const STATUS_NO_MEMORY: c_int = 2;

#[repr(C)]
struct StatsResult {
    average: f64,
    min: f64,
    max: f64,
}

extern "C" fn add(_handle: *mut c_void, a: f64, b: f64, out: *mut f64) -> c_int {
    // SAFETY: the dispatcher passes pre-allocated storage for a double.
    unsafe { out.write(a + b) };
    0
}

extern "C" fn sub(_handle: *mut c_void, a: f64, b: f64, out: *mut f64) -> c_int {
    // SAFETY: as in `add`.
    unsafe { out.write(a - b) };
    0
}

extern "C" fn sqrt(_handle: *mut c_void, a: f64, out: *mut f64) -> c_int {
    if a < 0.0 {
        return STATUS_DOMAIN;
    }
    // SAFETY: as in `add`.
    unsafe { out.write(a.sqrt()) };
    0
}

extern "C" fn stats(_handle: *mut c_void, input: RawSequence, out: *mut *mut StatsResult) -> c_int {
    if input.len == 0 || input.buf.is_null() {
        return STATUS_DOMAIN;
    }
    // SAFETY: the dispatcher passes a deserialized sequence of doubles.
    let values = unsafe { std::slice::from_raw_parts(input.buf.cast::<f64>(), input.len as usize) };

    // SAFETY: calloc has no preconditions; the result is checked for null.
    let result = unsafe { libc::calloc(1, std::mem::size_of::<StatsResult>()) }.cast::<StatsResult>();
    if result.is_null() {
        return STATUS_NO_MEMORY;
    }
    // SAFETY: `result` is a fresh block for one StatsResult; `out` is the
    // dispatcher's output cell.
    unsafe {
        result.write(StatsResult {
            average: values.iter().sum::<f64>() / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        });
        out.write(result);
    }
    0
}

pub fn interface() -> dynrpc_core::Result<InterfaceDescriptor> {
    InterfaceDescriptor::parse(DESCRIPTOR)
}

/// Function table in descriptor order. The demo keeps no state, so the
/// handle is null.
pub fn service() -> ServiceTable {
    let functions = [
        add as *const c_void,
        sub as *const c_void,
        sqrt as *const c_void,
        stats as *const c_void,
    ];
    let methods = functions
        .into_iter()
        // SAFETY: each function matches its descriptor entry above.
        .filter_map(|f| unsafe { NativeFn::from_ptr(f) })
        .collect();
    ServiceTable::new(std::ptr::null_mut(), methods)
}
