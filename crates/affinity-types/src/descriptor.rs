//! Method and field descriptor parsing.
//!
//! Descriptors follow the familiar class-file grammar: a field descriptor is a
//! single value type (`I`, `Z`, `Ljava/lang/String;`, `[I`, ...), a method
//! descriptor is `(` params `)` return, with `V` for no return value.

use smallvec::SmallVec;

/// Coarse value category of a descriptor element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Bool,
    Reference,
}

/// Parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: SmallVec<[ValueKind; 8]>,
    /// `None` for `V`.
    pub returns: Option<ValueKind>,
}

impl MethodDescriptor {
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn returns_value(&self) -> bool {
        self.returns.is_some()
    }
}

/// Error produced for malformed descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorError {
    pub descriptor: String,
    pub reason: &'static str,
}

impl std::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid descriptor '{}': {}", self.descriptor, self.reason)
    }
}

impl std::error::Error for DescriptorError {}

/// Parse a method descriptor such as `(ILjava/lang/String;)V`.
pub fn parse_method_descriptor(descriptor: &str) -> Result<MethodDescriptor, DescriptorError> {
    let err = |reason| DescriptorError {
        descriptor: descriptor.to_string(),
        reason,
    };
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(err("missing '('"));
    }
    let mut pos = 1;
    let mut params = SmallVec::new();
    loop {
        match bytes.get(pos) {
            Some(b')') => {
                pos += 1;
                break;
            }
            Some(_) => {
                let (kind, next) = parse_value(bytes, pos).ok_or_else(|| err("bad parameter"))?;
                params.push(kind);
                pos = next;
            }
            None => return Err(err("missing ')'")),
        }
    }
    let returns = match bytes.get(pos) {
        Some(b'V') if pos + 1 == bytes.len() => None,
        Some(_) => {
            let (kind, next) = parse_value(bytes, pos).ok_or_else(|| err("bad return type"))?;
            if next != bytes.len() {
                return Err(err("trailing characters"));
            }
            Some(kind)
        }
        None => return Err(err("missing return type")),
    };
    Ok(MethodDescriptor { params, returns })
}

/// Parse a field descriptor.
pub fn parse_field_descriptor(descriptor: &str) -> Result<ValueKind, DescriptorError> {
    match parse_value(descriptor.as_bytes(), 0) {
        Some((kind, next)) if next == descriptor.len() => Ok(kind),
        _ => Err(DescriptorError {
            descriptor: descriptor.to_string(),
            reason: "not a single value type",
        }),
    }
}

fn parse_value(bytes: &[u8], pos: usize) -> Option<(ValueKind, usize)> {
    match bytes.get(pos)? {
        b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D' => Some((ValueKind::Int, pos + 1)),
        b'Z' => Some((ValueKind::Bool, pos + 1)),
        b'L' => {
            let end = bytes[pos..].iter().position(|b| *b == b';')?;
            if end < 2 {
                return None;
            }
            Some((ValueKind::Reference, pos + end + 1))
        }
        b'[' => {
            let (_, next) = parse_value(bytes, pos + 1)?;
            Some((ValueKind::Reference, next))
        }
        _ => None,
    }
}
