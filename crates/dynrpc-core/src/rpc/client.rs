//! Client side: encode a call from native arguments and apply the reply.
//!
//! Both functions take the argument array of a local proxy call in the same
//! shape the dispatcher hands to libffi: `args[i]` points at the value of
//! argument `i`. For a `*T` argument that value is the caller's `T*`; for a
//! `**T` argument it is the caller's `T**`.

#![allow(unsafe_code)]

use super::envelope::{CallEnvelope, ReplyEnvelope};
use crate::codec;
use crate::descriptor::{ArgumentDescriptor, MethodDescriptor, PassingMode};
use crate::error::{DynRpcError, Result};
use serde_json::Value;
use std::ffi::c_void;
use tracing::{debug, warn};

fn argument_error(method: &MethodDescriptor, arg: &ArgumentDescriptor, message: impl Into<String>) -> DynRpcError {
    DynRpcError::Argument {
        signature: method.signature().to_string(),
        index: arg.index(),
        message: message.into(),
    }
}

fn check_arity(method: &MethodDescriptor, args: &[*mut c_void]) -> Result<()> {
    if args.len() != method.arguments().len() {
        return Err(DynRpcError::Argument {
            signature: method.signature().to_string(),
            index: args.len(),
            message: format!(
                "expected {} arguments, got {}",
                method.arguments().len(),
                args.len()
            ),
        });
    }
    Ok(())
}

/// Build the request text for a call of `method`.
///
/// Only STANDARD arguments are placed on the wire, in declaration order.
///
/// # Safety
///
/// `args` must hold one entry per declared argument; every STANDARD entry
/// must point at a valid instance of that argument's type. Other entries are
/// not read.
pub unsafe fn prepare_invoke_request(method: &MethodDescriptor, args: &[*mut c_void]) -> Result<String> {
    check_arity(method, args)?;

    let mut wire = Vec::with_capacity(method.wire_argument_count());
    for (arg, ptr) in method.arguments().iter().zip(args) {
        if arg.mode() != PassingMode::Standard {
            continue;
        }
        if ptr.is_null() {
            return Err(argument_error(method, arg, "argument pointer is null"));
        }
        // SAFETY: guaranteed by the caller for STANDARD entries.
        let value = unsafe { codec::serialize(arg.ty(), ptr.cast_const().cast()) }
            .map_err(|e| argument_error(method, arg, e.to_string()))?;
        wire.push(value);
    }

    let request = CallEnvelope::new(method.signature(), wire).to_text()?;
    debug!("Prepared request: {}", request);
    Ok(request)
}

/// Apply `reply` to the caller's output arguments and return the remote status.
///
/// A `{"e": code}` reply returns `code` without touching any argument. On
/// success the `r` value is written into the result-bearing argument:
/// copied into the caller's storage for a `*T` argument, or stored as a newly
/// allocated value whose ownership passes to the caller for a `**T`/`*t`
/// argument. A missing or `null` result for the latter stores a null pointer.
///
/// # Safety
///
/// `args` must hold one entry per declared argument. For a `*T` argument the
/// entry must point at a valid `T*` that itself points at writable storage for
/// a `T`; for an output argument it must point at a valid pointer to writable
/// storage for one pointer. The caller's previous contents of that storage are
/// overwritten without being released.
pub unsafe fn handle_reply(method: &MethodDescriptor, reply: &str, args: &[*mut c_void]) -> Result<i32> {
    check_arity(method, args)?;
    debug!("Handling reply for '{}': {}", method.signature(), reply);
    let envelope = ReplyEnvelope::parse(reply)?;

    if let Some(status) = envelope.error {
        warn!(
            "Remote call '{}' failed with error code {}",
            method.signature(),
            status
        );
        return Ok(status);
    }

    let Some(arg) = method.result_argument() else {
        if envelope.result.is_some() {
            debug!("Ignoring result of '{}': no output argument", method.signature());
        }
        return Ok(envelope.status());
    };
    let slot = args[arg.index()];
    if slot.is_null() {
        return Err(argument_error(method, arg, "argument pointer is null"));
    }
    // SAFETY: the caller guarantees the entry points at a pointer.
    let dest = unsafe { slot.cast::<*mut u8>().read() };
    if dest.is_null() {
        return Err(argument_error(method, arg, "output storage is null"));
    }

    match arg.mode() {
        PassingMode::PreAllocatedOutput => {
            let result = envelope.result.as_ref().ok_or_else(|| DynRpcError::MissingResult {
                signature: method.signature().to_string(),
            })?;
            let scratch = codec::deserialize(arg.value_type(), result)
                .map_err(|e| argument_error(method, arg, e.to_string()))?;
            // SAFETY: `dest` is the caller's `T*`, writable for a `T`.
            unsafe { scratch.move_into(dest) };
        }
        PassingMode::Output => {
            let result = envelope.result.as_ref().unwrap_or(&Value::Null);
            // The value type is itself a pointer kind, so `null` yields a
            // null pointer rather than an error.
            let value = codec::deserialize(arg.value_type(), result)
                .map_err(|e| argument_error(method, arg, e.to_string()))?;
            // SAFETY: `dest` is the caller's pointer location.
            unsafe { value.move_into(dest) };
        }
        PassingMode::Standard | PassingMode::Handle => {}
    }
    Ok(envelope.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TypeRegistry;
    use crate::native::{free, live_allocations};
    use std::ptr;

    fn method(signature: &str, descriptor: &str) -> MethodDescriptor {
        MethodDescriptor::parse(signature, 0, descriptor, &TypeRegistry::new()).unwrap()
    }

    #[test]
    fn test_prepare_skips_non_standard_arguments() {
        let add = method("add(DD)D", "add(#am=handle;PDD#am=pre;*D)N");
        let mut handle: *mut c_void = ptr::null_mut();
        let mut a = 2.0f64;
        let mut b = 3.0f64;
        let mut out = 0f64;
        let mut out_ptr: *mut f64 = &mut out;
        let args: Vec<*mut c_void> = vec![
            (&mut handle as *mut *mut c_void).cast(),
            (&mut a as *mut f64).cast(),
            (&mut b as *mut f64).cast(),
            (&mut out_ptr as *mut *mut f64).cast(),
        ];

        // SAFETY: every entry points at a live value of its argument type.
        let request = unsafe { prepare_invoke_request(&add, &args) }.unwrap();
        assert_eq!(request, r#"{"m":"add(DD)D","a":[2.0,3.0]}"#);
    }

    #[test]
    fn test_prepare_rejects_wrong_arity() {
        let add = method("add(DD)D", "add(#am=handle;PDD#am=pre;*D)N");
        // SAFETY: nothing is read before the arity check.
        let result = unsafe { prepare_invoke_request(&add, &[]) };
        assert!(matches!(result, Err(DynRpcError::Argument { .. })));
    }

    #[test]
    fn test_error_reply_leaves_output_untouched() {
        let add = method("add(DD)D", "add(#am=handle;PDD#am=pre;*D)N");
        let mut out = 7.5f64;
        let mut out_ptr: *mut f64 = &mut out;
        let args: Vec<*mut c_void> = vec![
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            (&mut out_ptr as *mut *mut f64).cast(),
        ];

        // SAFETY: only the output entry may be read and it is valid.
        let status = unsafe { handle_reply(&add, r#"{"e":3}"#, &args) }.unwrap();
        assert_eq!(status, 3);
        assert_eq!(out, 7.5);
    }

    #[test]
    fn test_invalid_replies_leave_output_untouched() {
        let add = method("add(DD)D", "add(#am=handle;PDD#am=pre;*D)N");
        let mut out = 7.5f64;
        let mut out_ptr: *mut f64 = &mut out;
        let args: Vec<*mut c_void> = vec![
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            (&mut out_ptr as *mut *mut f64).cast(),
        ];

        for reply in [r#"{"e":0}"#, r#"{"r":5.0,"e":2}"#, "[5.0,null]"] {
            // SAFETY: only the output entry may be read and it is valid.
            let result = unsafe { handle_reply(&add, reply, &args) };
            assert_eq!(
                result.unwrap_err().kind(),
                crate::error::ErrorKind::Transport,
                "reply {}",
                reply
            );
        }
        assert_eq!(out, 7.5);
    }

    #[test]
    fn test_pre_allocated_reply_is_copied() {
        let add = method("add(DD)D", "add(#am=handle;PDD#am=pre;*D)N");
        let mut out = 0f64;
        let mut out_ptr: *mut f64 = &mut out;
        let args: Vec<*mut c_void> = vec![
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            (&mut out_ptr as *mut *mut f64).cast(),
        ];
        let before = live_allocations();

        // SAFETY: the output entry points at a valid `double*`.
        let status = unsafe { handle_reply(&add, r#"{"r":5.0}"#, &args) }.unwrap();
        assert_eq!(status, 0);
        assert_eq!(out, 5.0);
        assert_eq!(live_allocations(), before);

        // SAFETY: as above.
        let missing = unsafe { handle_reply(&add, "{}", &args) };
        assert!(matches!(missing, Err(DynRpcError::MissingResult { .. })));
    }

    #[test]
    fn test_output_reply_transfers_ownership() {
        let name = method("name()t", "name(#am=handle;P#am=out;*t)N");
        let mut text: *mut u8 = ptr::null_mut();
        let mut text_ref: *mut *mut u8 = &mut text;
        let args: Vec<*mut c_void> = vec![
            ptr::null_mut(),
            (&mut text_ref as *mut *mut *mut u8).cast(),
        ];
        let before = live_allocations();

        // SAFETY: the output entry points at a valid `char**`.
        unsafe { handle_reply(&name, r#"{"r":"calc"}"#, &args) }.unwrap();
        assert!(!text.is_null());
        assert_eq!(live_allocations(), before + 1);
        // SAFETY: the decoder stored a NUL-terminated string.
        let value = unsafe { std::ffi::CStr::from_ptr(text.cast()) };
        assert_eq!(value.to_str().unwrap(), "calc");

        // SAFETY: ownership of the string moved to this test.
        unsafe { free(text) };
        assert_eq!(live_allocations(), before);

        // SAFETY: as above.
        unsafe { handle_reply(&name, "{}", &args) }.unwrap();
        assert!(text.is_null());
    }

    #[test]
    fn test_malformed_reply_is_transport_error() {
        let ping = method("ping()N", "ping(#am=handle;P)N");
        // SAFETY: no entry is read.
        let result = unsafe { handle_reply(&ping, "{\"r\":", &[ptr::null_mut()]) };
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::Transport);
    }
}
