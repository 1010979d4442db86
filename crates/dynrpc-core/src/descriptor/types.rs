//! Recursive native type model and its single-character descriptor grammar.
//!
//! ```text
//! Z bool   B i8   b u8   S i16  s u16  I i32  i u32  J i64  j u64
//! F f32    D f64  N int  V void P void*  t char*
//! *X       typed pointer to X
//! [X       sequence { u32 cap; u32 len; X *buf; }
//! {XY a b} struct with members a: X, b: Y
//! Lname;   named type from the interface `:types` section
//! ```

use crate::config::DescriptorConfig;
use crate::error::{DynRpcError, Result};
use crate::native::RawSequence;
use std::alloc::Layout;
use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_int;

/// Named types available to `L<name>;` references.
pub type TypeRegistry = HashMap<String, DynType>;

/// Fixed-width native scalar kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// C `int`, the status code type of every invocable method.
    NativeInt,
}

impl Primitive {
    fn from_code(code: u8) -> Option<Self> {
        let primitive = match code {
            b'Z' => Primitive::Bool,
            b'B' => Primitive::I8,
            b'b' => Primitive::U8,
            b'S' => Primitive::I16,
            b's' => Primitive::U16,
            b'I' => Primitive::I32,
            b'i' => Primitive::U32,
            b'J' => Primitive::I64,
            b'j' => Primitive::U64,
            b'F' => Primitive::F32,
            b'D' => Primitive::F64,
            b'N' => Primitive::NativeInt,
            _ => return None,
        };
        Some(primitive)
    }

    /// Descriptor character for this primitive.
    pub fn code(self) -> char {
        match self {
            Primitive::Bool => 'Z',
            Primitive::I8 => 'B',
            Primitive::U8 => 'b',
            Primitive::I16 => 'S',
            Primitive::U16 => 's',
            Primitive::I32 => 'I',
            Primitive::U32 => 'i',
            Primitive::I64 => 'J',
            Primitive::U64 => 'j',
            Primitive::F32 => 'F',
            Primitive::F64 => 'D',
            Primitive::NativeInt => 'N',
        }
    }

    pub fn layout(self) -> Layout {
        match self {
            Primitive::Bool => Layout::new::<bool>(),
            Primitive::I8 => Layout::new::<i8>(),
            Primitive::U8 => Layout::new::<u8>(),
            Primitive::I16 => Layout::new::<i16>(),
            Primitive::U16 => Layout::new::<u16>(),
            Primitive::I32 => Layout::new::<i32>(),
            Primitive::U32 => Layout::new::<u32>(),
            Primitive::I64 => Layout::new::<i64>(),
            Primitive::U64 => Layout::new::<u64>(),
            Primitive::F32 => Layout::new::<f32>(),
            Primitive::F64 => Layout::new::<f64>(),
            Primitive::NativeInt => Layout::new::<c_int>(),
        }
    }
}

/// A named struct member at a fixed C-layout offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    ty: DynType,
    offset: usize,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &DynType {
        &self.ty
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Ordered named-field struct with its C layout computed up front.
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    fields: Vec<Field>,
    layout: Layout,
}

impl StructType {
    /// Build a struct from `(name, type)` members in declaration order.
    pub fn new(members: Vec<(String, DynType)>) -> Result<Self> {
        if members.is_empty() {
            return Err(DynRpcError::type_descriptor("{}", "struct has no members"));
        }

        let mut layout = Layout::new::<()>();
        let mut fields: Vec<Field> = Vec::with_capacity(members.len());
        for (name, ty) in members {
            if fields.iter().any(|f| f.name == name) {
                return Err(DynRpcError::type_descriptor(
                    ty.to_string(),
                    format!("duplicate struct member '{}'", name),
                ));
            }
            let (extended, offset) = layout
                .extend(ty.layout())
                .map_err(|e| DynRpcError::type_descriptor(ty.to_string(), e.to_string()))?;
            layout = extended;
            fields.push(Field { name, ty, offset });
        }

        Ok(Self {
            fields,
            layout: layout.pad_to_align(),
        })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }
}

/// A native type described by a descriptor string.
#[derive(Debug, Clone, PartialEq)]
pub enum DynType {
    /// Only valid as a function return type.
    Void,
    Primitive(Primitive),
    /// NUL-terminated `char*` owned by the value holding it.
    Text,
    /// `void*`; never marshalled, used for service handles.
    Untyped,
    /// Typed pointer owning its target.
    Pointer(Box<DynType>),
    /// `{ u32 cap; u32 len; T *buf; }` owning its buffer.
    Sequence(Box<DynType>),
    Struct(StructType),
}

impl DynType {
    /// Parse a standalone type descriptor (no named type references).
    pub fn parse(descriptor: &str) -> Result<Self> {
        Self::parse_with(descriptor, &TypeRegistry::new())
    }

    /// Parse a type descriptor, resolving `L<name>;` against `types`.
    pub fn parse_with(descriptor: &str, types: &TypeRegistry) -> Result<Self> {
        let mut parser = TypeParser::new(descriptor, types);
        let ty = parser.parse_type(0)?;
        parser.finish()?;
        Ok(ty)
    }

    pub fn layout(&self) -> Layout {
        match self {
            DynType::Void => Layout::new::<()>(),
            DynType::Primitive(p) => p.layout(),
            DynType::Text | DynType::Untyped | DynType::Pointer(_) => Layout::new::<*mut u8>(),
            DynType::Sequence(_) => Layout::new::<RawSequence>(),
            DynType::Struct(s) => s.layout(),
        }
    }

    pub fn size(&self) -> usize {
        self.layout().size()
    }

    pub fn alignment(&self) -> usize {
        self.layout().align()
    }

    /// True for `N`, the only accepted return type of an invocable method.
    pub fn is_native_int(&self) -> bool {
        matches!(self, DynType::Primitive(Primitive::NativeInt))
    }

    /// True for every type whose native representation is a single pointer.
    pub fn is_pointer(&self) -> bool {
        matches!(self, DynType::Text | DynType::Untyped | DynType::Pointer(_))
    }

    /// Descriptor text of the type, with named references expanded.
    pub fn descriptor(&self) -> String {
        self.to_string()
    }

    /// Target type of a typed pointer.
    pub fn pointee(&self) -> Option<&DynType> {
        match self {
            DynType::Pointer(inner) => Some(&**inner),
            _ => None,
        }
    }
}

impl fmt::Display for DynType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynType::Void => write!(f, "V"),
            DynType::Primitive(p) => write!(f, "{}", p.code()),
            DynType::Text => write!(f, "t"),
            DynType::Untyped => write!(f, "P"),
            DynType::Pointer(inner) => write!(f, "*{}", inner),
            DynType::Sequence(inner) => write!(f, "[{}", inner),
            DynType::Struct(s) => {
                write!(f, "{{")?;
                for field in s.fields() {
                    write!(f, "{}", field.ty())?;
                }
                for field in s.fields() {
                    write!(f, " {}", field.name())?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Cursor over a descriptor string; shared with the function parser.
pub(crate) struct TypeParser<'a> {
    text: &'a str,
    src: &'a [u8],
    pos: usize,
    types: &'a TypeRegistry,
}

impl<'a> TypeParser<'a> {
    pub(crate) fn new(text: &'a str, types: &'a TypeRegistry) -> Self {
        Self {
            text,
            src: text.as_bytes(),
            pos: 0,
            types,
        }
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    pub(crate) fn error(&self, message: impl fmt::Display) -> DynRpcError {
        DynRpcError::type_descriptor(self.text, format!("{} (at offset {})", message, self.pos))
    }

    pub(crate) fn expect(&mut self, expected: u8) -> Result<()> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.error(format!("expected '{}'", expected as char))),
        }
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.pos == self.src.len() {
            Ok(())
        } else {
            Err(self.error("trailing characters"))
        }
    }

    /// Consume up to and including `end`, returning the text before it.
    pub(crate) fn take_until(&mut self, end: u8) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == end {
                let taken = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(taken);
            }
            self.pos += 1;
        }
        Err(self.error(format!("expected '{}'", end as char)))
    }

    /// Zero or more `#key=value;` meta properties.
    pub(crate) fn parse_meta(&mut self) -> Result<Vec<(String, String)>> {
        let mut meta = Vec::new();
        while self.peek() == Some(b'#') {
            self.pos += 1;
            let key = self.take_until(b'=')?;
            let value = self.take_until(b';')?;
            meta.push((key, value));
        }
        Ok(meta)
    }

    /// A type that can hold a value, i.e. anything but `V`.
    pub(crate) fn parse_value_type(&mut self, depth: usize) -> Result<DynType> {
        let ty = self.parse_type(depth)?;
        if ty == DynType::Void {
            return Err(self.error("'V' is only valid as a return type"));
        }
        Ok(ty)
    }

    pub(crate) fn parse_type(&mut self, depth: usize) -> Result<DynType> {
        if depth > DescriptorConfig::MAX_TYPE_DEPTH {
            return Err(self.error("type nesting too deep"));
        }
        let code = self
            .bump()
            .ok_or_else(|| self.error("unexpected end of descriptor"))?;
        if let Some(p) = Primitive::from_code(code) {
            return Ok(DynType::Primitive(p));
        }
        match code {
            b'V' => Ok(DynType::Void),
            b'P' => Ok(DynType::Untyped),
            b't' => Ok(DynType::Text),
            b'*' => Ok(DynType::Pointer(Box::new(self.parse_value_type(depth + 1)?))),
            b'[' => Ok(DynType::Sequence(Box::new(self.parse_value_type(depth + 1)?))),
            b'{' => self.parse_struct(depth + 1),
            b'L' => self.parse_reference(),
            other => Err(self.error(format!("unknown type code '{}'", other as char))),
        }
    }

    fn parse_struct(&mut self, depth: usize) -> Result<DynType> {
        let mut types = Vec::new();
        loop {
            match self.peek() {
                Some(b' ') => {
                    self.pos += 1;
                    break;
                }
                Some(b'}') | None => {
                    return Err(self.error("struct needs member types, a space, then names"))
                }
                Some(_) => types.push(self.parse_value_type(depth)?),
            }
        }

        let mut names = Vec::with_capacity(types.len());
        loop {
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == b' ' || c == b'}' {
                    break;
                }
                self.pos += 1;
            }
            if start == self.pos {
                return Err(self.error("empty struct member name"));
            }
            names.push(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned());
            match self.bump() {
                Some(b' ') => continue,
                Some(b'}') => break,
                _ => return Err(self.error("unterminated struct")),
            }
        }

        if names.len() != types.len() {
            return Err(self.error(format!(
                "struct has {} member types but {} names",
                types.len(),
                names.len()
            )));
        }

        let members = names.into_iter().zip(types).collect();
        Ok(DynType::Struct(StructType::new(members)?))
    }

    fn parse_reference(&mut self) -> Result<DynType> {
        let name = self.take_until(b';')?;
        self.types
            .get(&name)
            .cloned()
            .ok_or_else(|| self.error(format!("unknown type reference '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_primitives() {
        assert_eq!(DynType::parse("D").unwrap(), DynType::Primitive(Primitive::F64));
        assert_eq!(DynType::parse("j").unwrap(), DynType::Primitive(Primitive::U64));
        assert!(DynType::parse("N").unwrap().is_native_int());
        assert!(!DynType::parse("I").unwrap().is_native_int());
        assert_eq!(DynType::parse("t").unwrap(), DynType::Text);
        assert_eq!(DynType::parse("P").unwrap(), DynType::Untyped);
    }

    #[test]
    fn test_struct_layout_matches_c() {
        let ty = DynType::parse("{BID a b c}").unwrap();
        let DynType::Struct(s) = &ty else {
            panic!("expected struct");
        };
        let offsets: Vec<usize> = s.fields().iter().map(|f| f.offset()).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(ty.size(), 16);
        assert_eq!(ty.alignment(), 8);
        assert_eq!(s.field("b").unwrap().ty(), &DynType::Primitive(Primitive::I32));
    }

    #[test]
    fn test_struct_size_padded_to_alignment() {
        let ty = DynType::parse("{DB value flag}").unwrap();
        assert_eq!(ty.size(), 16);
    }

    #[test]
    fn test_sequence_and_pointer_layout() {
        let seq = DynType::parse("[D").unwrap();
        assert_eq!(seq.size(), std::mem::size_of::<RawSequence>());
        let ptr = DynType::parse("**D").unwrap();
        assert_eq!(ptr.size(), std::mem::size_of::<*mut u8>());
        assert_eq!(
            ptr.pointee().and_then(DynType::pointee),
            Some(&DynType::Primitive(Primitive::F64))
        );
    }

    #[test]
    fn test_named_reference() {
        let mut types = TypeRegistry::new();
        types.insert("Point".to_string(), DynType::parse("{DD x y}").unwrap());
        let ty = DynType::parse_with("[LPoint;", &types).unwrap();
        assert_eq!(ty.descriptor(), "[{DD x y}");
    }

    #[test]
    fn test_display_roundtrip() {
        for descriptor in ["{It[D id name values}", "**t", "[{ZJ ok n}"] {
            let ty = DynType::parse(descriptor).unwrap();
            assert_eq!(ty.to_string(), descriptor);
        }
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "Q", "{DD a}", "{DD a b", "{ a}", "*", "*V", "LMissing;", "DD", "{DD a a}"] {
            let result = DynType::parse(bad);
            assert!(result.is_err(), "expected '{}' to be rejected", bad);
        }
    }

    #[test]
    fn test_nesting_limit() {
        let deep = "*".repeat(DescriptorConfig::MAX_TYPE_DEPTH + 2) + "D";
        assert!(DynType::parse(&deep).is_err());
    }
}
