// Built-in scalar kinds, endianness and size policies

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "little" => Some(Endian::Little),
            "big" => Some(Endian::Big),
            "native" => Some(Endian::native()),
            _ => None,
        }
    }
}

impl fmt::Display for Endian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Endian::Little => "little",
            Endian::Big => "big",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitOrder {
    #[default]
    RightToLeft,
    LeftToRight,
}

/// Built-in scalar kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Unsigned(u8),
    Signed(u8),
    Float,
    Double,
    Char,
    Char16,
    Bool,
    Str,
    Padding,
    Auto,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        let width = |digits: &str| -> Option<u8> {
            match digits.parse::<u8>().ok()? {
                w @ (8 | 16 | 24 | 32 | 48 | 64 | 96 | 128) => Some(w / 8),
                _ => None,
            }
        };
        Some(match name {
            "float" => Builtin::Float,
            "double" => Builtin::Double,
            "char" => Builtin::Char,
            "char16" => Builtin::Char16,
            "bool" => Builtin::Bool,
            "str" => Builtin::Str,
            "padding" => Builtin::Padding,
            "auto" => Builtin::Auto,
            _ if name.starts_with('u') => Builtin::Unsigned(width(&name[1..])?),
            _ if name.starts_with('s') => Builtin::Signed(width(&name[1..])?),
            _ => return None,
        })
    }

    /// Byte size, `None` for kinds without a fixed width
    pub fn size(&self) -> Option<u64> {
        match self {
            Builtin::Unsigned(n) | Builtin::Signed(n) => Some(*n as u64),
            Builtin::Float => Some(4),
            Builtin::Double => Some(8),
            Builtin::Char | Builtin::Bool | Builtin::Padding => Some(1),
            Builtin::Char16 => Some(2),
            Builtin::Str | Builtin::Auto => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Builtin::Unsigned(_) | Builtin::Signed(_))
    }

    pub fn is_character(&self) -> bool {
        matches!(self, Builtin::Char | Builtin::Char16)
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Builtin::Unsigned(n) => write!(f, "u{}", *n as u32 * 8),
            Builtin::Signed(n) => write!(f, "s{}", *n as u32 * 8),
            Builtin::Float => f.write_str("float"),
            Builtin::Double => f.write_str("double"),
            Builtin::Char => f.write_str("char"),
            Builtin::Char16 => f.write_str("char16"),
            Builtin::Bool => f.write_str("bool"),
            Builtin::Str => f.write_str("str"),
            Builtin::Padding => f.write_str("padding"),
            Builtin::Auto => f.write_str("auto"),
        }
    }
}

/// How the byte size of a type is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePolicy {
    Fixed(u64),
    /// Depends on data or expressions evaluated during placement
    Dynamic,
    /// Ends at a sentinel found while reading
    Terminated,
}

/// Type description produced by registered type factories
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Builtin(Builtin),
    Array(Box<TypeSpec>, u64),
    /// A user-declared type, by fully-qualified name
    Named(String),
    Endian(Endian, Box<TypeSpec>),
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpec::Builtin(b) => write!(f, "{}", b),
            TypeSpec::Array(inner, n) => write!(f, "{}[{}]", inner, n),
            TypeSpec::Named(n) => f.write_str(n),
            TypeSpec::Endian(e, inner) => {
                write!(f, "{} {}", if *e == Endian::Big { "be" } else { "le" }, inner)
            }
        }
    }
}
