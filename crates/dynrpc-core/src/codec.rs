//! JSON ⇄ native value conversion keyed by type descriptor.
//!
//! | Type | JSON |
//! |------|------|
//! | `Z` | boolean |
//! | integers, `N` | number, range checked into the native width |
//! | `F`, `D` | number (integers accepted) |
//! | `t` | string, or `null` for a null pointer |
//! | `*X` | value of `X`, or `null` for a null pointer |
//! | `{..}` | object with every member present |
//! | `[X` | array |
//!
//! `P` and `V` cannot be marshalled.

#![allow(unsafe_code)]

use crate::descriptor::{DynType, Primitive};
use crate::error::{DynRpcError, Result};
use crate::native::{alloc_text, alloc_zeroed, NativeValue, RawSequence};
use serde_json::{Map, Number, Value};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};

fn mismatch(ty: &DynType, expected: &str, found: &Value) -> DynRpcError {
    DynRpcError::codec(ty.to_string(), format!("expected {}, got {}", expected, found))
}

/// Deserialize `value` into a freshly allocated instance of `ty`.
///
/// On failure everything allocated so far is released.
pub fn deserialize<'t>(ty: &'t DynType, value: &Value) -> Result<NativeValue<'t>> {
    let native = NativeValue::alloc(ty)?;
    // SAFETY: `native` is a zeroed block sized for `ty`; on error its drop
    // releases whatever was written so far.
    unsafe { write_value(ty, value, native.as_ptr())? };
    Ok(native)
}

/// Serialize an owned native value.
pub fn serialize_value(value: &NativeValue<'_>) -> Result<Value> {
    // SAFETY: a NativeValue always holds a valid instance of its type.
    unsafe { serialize(value.ty(), value.as_ptr()) }
}

/// Serialize the instance of `ty` at `value`.
///
/// # Safety
///
/// `value` must point at a readable, valid instance of `ty`.
pub unsafe fn serialize(ty: &DynType, value: *const u8) -> Result<Value> {
    match ty {
        // SAFETY: forwarded from the caller.
        DynType::Primitive(p) => unsafe { read_primitive(*p, value) },
        DynType::Text => {
            // SAFETY: a text value is one char pointer.
            let text = unsafe { value.cast::<*const c_char>().read() };
            if text.is_null() {
                return Ok(Value::Null);
            }
            // SAFETY: non-null text values are NUL terminated.
            let text = unsafe { CStr::from_ptr(text) };
            text.to_str()
                .map(|s| Value::String(s.to_string()))
                .map_err(|e| DynRpcError::codec("t", e.to_string()))
        }
        DynType::Pointer(inner) => {
            // SAFETY: a typed pointer is one pointer to an instance of `inner`.
            let target = unsafe { value.cast::<*const u8>().read() };
            if target.is_null() {
                return Ok(Value::Null);
            }
            // SAFETY: see above.
            unsafe { serialize(inner, target) }
        }
        DynType::Struct(s) => {
            let mut object = Map::new();
            for field in s.fields() {
                // SAFETY: field offsets lie inside the struct layout.
                let member = unsafe { serialize(field.ty(), value.add(field.offset()))? };
                object.insert(field.name().to_string(), member);
            }
            Ok(Value::Object(object))
        }
        DynType::Sequence(element) => {
            // SAFETY: a sequence value is a RawSequence.
            let seq = unsafe { value.cast::<RawSequence>().read() };
            if seq.len > 0 && seq.buf.is_null() {
                return Err(DynRpcError::codec(
                    ty.to_string(),
                    format!("sequence of length {} has no buffer", seq.len),
                ));
            }
            let stride = element.size();
            let mut items = Vec::with_capacity(seq.len as usize);
            for i in 0..seq.len as usize {
                // SAFETY: the first `len` elements of `buf` are valid.
                items.push(unsafe { serialize(element, seq.buf.add(i * stride))? });
            }
            Ok(Value::Array(items))
        }
        DynType::Untyped | DynType::Void => Err(DynRpcError::codec(
            ty.to_string(),
            "type cannot be serialized",
        )),
    }
}

/// # Safety
///
/// `dest` must point at a zeroed block sized and aligned for `ty`.
unsafe fn write_value(ty: &DynType, value: &Value, dest: *mut u8) -> Result<()> {
    match ty {
        // SAFETY: forwarded from the caller.
        DynType::Primitive(p) => unsafe { write_primitive(*p, value, dest) },
        DynType::Text => match value {
            Value::Null => Ok(()),
            Value::String(s) => {
                let text = alloc_text(s)?;
                // SAFETY: a text value is one char pointer.
                unsafe { dest.cast::<*mut u8>().write(text.as_ptr()) };
                Ok(())
            }
            other => Err(mismatch(ty, "string", other)),
        },
        DynType::Pointer(inner) => {
            if value.is_null() {
                return Ok(());
            }
            let target = deserialize(inner, value)?;
            // SAFETY: a typed pointer is one pointer; `dest` now owns the target.
            unsafe { dest.cast::<*mut u8>().write(target.into_raw().as_ptr()) };
            Ok(())
        }
        DynType::Struct(s) => {
            let object = value.as_object().ok_or_else(|| mismatch(ty, "object", value))?;
            for field in s.fields() {
                let member = object.get(field.name()).ok_or_else(|| {
                    DynRpcError::codec(ty.to_string(), format!("missing member '{}'", field.name()))
                })?;
                // SAFETY: field offsets lie inside the struct layout.
                unsafe { write_value(field.ty(), member, dest.add(field.offset()))? };
            }
            Ok(())
        }
        DynType::Sequence(element) => {
            let items = value.as_array().ok_or_else(|| mismatch(ty, "array", value))?;
            if items.is_empty() {
                return Ok(());
            }
            let len = u32::try_from(items.len()).map_err(|_| {
                DynRpcError::codec(ty.to_string(), format!("{} elements do not fit a sequence", items.len()))
            })?;
            let stride = element.size();
            let size = stride.checked_mul(items.len()).ok_or(DynRpcError::Allocation {
                size: usize::MAX,
            })?;
            let buf = alloc_zeroed(size)?.as_ptr();
            // SAFETY: `dest` is a zeroed RawSequence. The buffer is recorded
            // before it is filled so a failure part way still releases it.
            unsafe { dest.cast::<RawSequence>().write(RawSequence { cap: len, len, buf }) };
            for (i, item) in items.iter().enumerate() {
                // SAFETY: element `i` lies inside the zeroed buffer.
                unsafe { write_value(element, item, buf.add(i * stride))? };
            }
            Ok(())
        }
        DynType::Untyped | DynType::Void => Err(DynRpcError::codec(
            ty.to_string(),
            "type cannot be deserialized",
        )),
    }
}

fn signed<T: TryFrom<i64>>(p: Primitive, value: &Value) -> Result<T> {
    let n = value
        .as_i64()
        .ok_or_else(|| mismatch(&DynType::Primitive(p), "integer", value))?;
    T::try_from(n).map_err(|_| DynRpcError::codec(p.code().to_string(), format!("{} is out of range", n)))
}

fn unsigned<T: TryFrom<u64>>(p: Primitive, value: &Value) -> Result<T> {
    let n = value
        .as_u64()
        .ok_or_else(|| mismatch(&DynType::Primitive(p), "unsigned integer", value))?;
    T::try_from(n).map_err(|_| DynRpcError::codec(p.code().to_string(), format!("{} is out of range", n)))
}

fn float(p: Primitive, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| mismatch(&DynType::Primitive(p), "number", value))
}

fn single(p: Primitive, value: &Value) -> Result<f32> {
    let n = float(p, value)?;
    if n.abs() > f64::from(f32::MAX) {
        return Err(DynRpcError::codec(p.code().to_string(), format!("{} is out of range", n)));
    }
    Ok(n as f32)
}

/// # Safety
///
/// `dest` must be valid for writes of the primitive's size and aligned for it.
unsafe fn write_primitive(p: Primitive, value: &Value, dest: *mut u8) -> Result<()> {
    // SAFETY: forwarded from the caller for every arm.
    unsafe {
        match p {
            Primitive::Bool => {
                let b = value
                    .as_bool()
                    .ok_or_else(|| mismatch(&DynType::Primitive(p), "boolean", value))?;
                dest.cast::<bool>().write(b);
            }
            Primitive::I8 => dest.cast::<i8>().write(signed(p, value)?),
            Primitive::U8 => dest.cast::<u8>().write(unsigned(p, value)?),
            Primitive::I16 => dest.cast::<i16>().write(signed(p, value)?),
            Primitive::U16 => dest.cast::<u16>().write(unsigned(p, value)?),
            Primitive::I32 => dest.cast::<i32>().write(signed(p, value)?),
            Primitive::U32 => dest.cast::<u32>().write(unsigned(p, value)?),
            Primitive::I64 => dest.cast::<i64>().write(signed(p, value)?),
            Primitive::U64 => dest.cast::<u64>().write(unsigned(p, value)?),
            Primitive::F32 => dest.cast::<f32>().write(single(p, value)?),
            Primitive::F64 => dest.cast::<f64>().write(float(p, value)?),
            Primitive::NativeInt => dest.cast::<c_int>().write(signed(p, value)?),
        }
    }
    Ok(())
}

fn number(p: Primitive, n: f64) -> Result<Value> {
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| DynRpcError::codec(p.code().to_string(), format!("{} is not a finite number", n)))
}

/// # Safety
///
/// `src` must be valid for reads of the primitive's size and aligned for it.
unsafe fn read_primitive(p: Primitive, src: *const u8) -> Result<Value> {
    // SAFETY: forwarded from the caller for every arm.
    let value = unsafe {
        match p {
            Primitive::Bool => Value::Bool(src.cast::<u8>().read() != 0),
            Primitive::I8 => Value::from(src.cast::<i8>().read()),
            Primitive::U8 => Value::from(src.cast::<u8>().read()),
            Primitive::I16 => Value::from(src.cast::<i16>().read()),
            Primitive::U16 => Value::from(src.cast::<u16>().read()),
            Primitive::I32 => Value::from(src.cast::<i32>().read()),
            Primitive::U32 => Value::from(src.cast::<u32>().read()),
            Primitive::I64 => Value::from(src.cast::<i64>().read()),
            Primitive::U64 => Value::from(src.cast::<u64>().read()),
            Primitive::F32 => return number(p, f64::from(src.cast::<f32>().read())),
            Primitive::F64 => return number(p, src.cast::<f64>().read()),
            Primitive::NativeInt => Value::from(src.cast::<c_int>().read()),
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::live_allocations;
    use serde_json::json;

    #[test]
    fn test_double_roundtrip() {
        let ty = DynType::parse("D").unwrap();
        let native = deserialize(&ty, &json!(2.5)).unwrap();
        assert_eq!(serialize_value(&native).unwrap(), json!(2.5));
    }

    #[test]
    fn test_float_accepts_integer() {
        let ty = DynType::parse("D").unwrap();
        let native = deserialize(&ty, &json!(3)).unwrap();
        assert_eq!(serialize_value(&native).unwrap(), json!(3.0));
    }

    #[test]
    fn test_integer_range_checked() {
        let ty = DynType::parse("b").unwrap();
        assert!(deserialize(&ty, &json!(255)).is_ok());
        assert!(deserialize(&ty, &json!(256)).is_err());
        assert!(deserialize(&ty, &json!(-1)).is_err());

        let ty = DynType::parse("S").unwrap();
        let native = deserialize(&ty, &json!(-300)).unwrap();
        assert_eq!(serialize_value(&native).unwrap(), json!(-300));
    }

    #[test]
    fn test_single_float_range_checked() {
        let ty = DynType::parse("F").unwrap();
        let native = deserialize(&ty, &json!(1.5)).unwrap();
        assert_eq!(serialize_value(&native).unwrap(), json!(1.5));

        assert!(deserialize(&ty, &json!(1e300)).is_err());
        assert!(deserialize(&ty, &json!(-1e39)).is_err());
        assert!(deserialize(&ty, &json!(f64::from(f32::MAX))).is_ok());
    }

    #[test]
    fn test_struct_with_text_and_sequence() {
        let before = live_allocations();
        let ty = DynType::parse("{t[IZ name values ok}").unwrap();
        let value = json!({"name": "primes", "values": [2, 3, 5, 7], "ok": true});

        let native = deserialize(&ty, &value).unwrap();
        assert_eq!(serialize_value(&native).unwrap(), value);

        drop(native);
        assert_eq!(live_allocations(), before);
    }

    #[test]
    fn test_null_pointer_and_text() {
        let ty = DynType::parse("{*Dt score label}").unwrap();
        let native = deserialize(&ty, &json!({"score": null, "label": null})).unwrap();
        assert_eq!(
            serialize_value(&native).unwrap(),
            json!({"score": null, "label": null})
        );

        let native = deserialize(&ty, &json!({"score": 1.5, "label": "x"})).unwrap();
        assert_eq!(
            serialize_value(&native).unwrap(),
            json!({"score": 1.5, "label": "x"})
        );
    }

    #[test]
    fn test_empty_sequence() {
        let ty = DynType::parse("[D").unwrap();
        let native = deserialize(&ty, &json!([])).unwrap();
        assert_eq!(serialize_value(&native).unwrap(), json!([]));
    }

    #[test]
    fn test_partial_failure_releases_everything() {
        let before = live_allocations();
        let ty = DynType::parse("[{tD name weight}").unwrap();
        let value = json!([
            {"name": "a", "weight": 1.0},
            {"name": "b", "weight": "heavy"}
        ]);

        let err = deserialize(&ty, &value).unwrap_err();
        assert!(err.to_string().contains("expected number"));
        assert_eq!(live_allocations(), before);
    }

    #[test]
    fn test_missing_member() {
        let ty = DynType::parse("{DD x y}").unwrap();
        let err = deserialize(&ty, &json!({"x": 1.0})).unwrap_err();
        assert!(err.to_string().contains("missing member 'y'"));
    }

    #[test]
    fn test_untyped_pointer_not_marshalled() {
        let ty = DynType::Untyped;
        assert!(deserialize(&ty, &json!(0)).is_err());
        let native = NativeValue::alloc(&ty).unwrap();
        assert!(serialize_value(&native).is_err());
    }

    #[test]
    fn test_non_finite_double_rejected() {
        let ty = DynType::parse("D").unwrap();
        let native = NativeValue::alloc(&ty).unwrap();
        // SAFETY: the block holds one f64.
        unsafe { native.as_ptr().cast::<f64>().write(f64::NAN) };
        assert!(serialize_value(&native).is_err());
    }
}
