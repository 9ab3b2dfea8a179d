// Runtime value type for the pattern language evaluator

use std::fmt;

use crate::error::EvalError;
use crate::pattern::PatternId;
use crate::types::Builtin;
use serde::{Deserialize, Serialize};

/// Runtime value during evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Unsigned(u128),
    Signed(i128),
    Float(f64),
    Bool(bool),
    Char(char),
    String(String),
    Null,
    /// A placed pattern (struct, array, member, ...)
    Pattern(PatternId),
}

impl Value {
    /// Convert to unsigned integer
    #[inline]
    pub fn to_unsigned(&self) -> Result<u128, EvalError> {
        match self {
            Value::Unsigned(v) => Ok(*v),
            Value::Signed(v) => Ok(*v as u128),
            Value::Float(v) => Ok(*v as u128),
            Value::Bool(v) => Ok(u128::from(*v)),
            Value::Char(v) => Ok(*v as u128),
            Value::Null => Ok(0),
            // FourCC-style: raw bytes as a little-endian integer
            Value::String(s) if !s.is_empty() && s.len() <= 16 => Ok(s
                .bytes()
                .enumerate()
                .fold(0u128, |acc, (i, b)| acc | (b as u128) << (i * 8))),
            _ => Err(EvalError::type_mismatch(format!(
                "cannot convert {} to an unsigned integer",
                self.kind_name()
            ))),
        }
    }

    /// Convert to signed integer
    #[inline]
    pub fn to_signed(&self) -> Result<i128, EvalError> {
        match self {
            Value::Unsigned(v) => Ok(*v as i128),
            Value::Signed(v) => Ok(*v),
            Value::Float(v) => Ok(*v as i128),
            Value::Bool(v) => Ok(i128::from(*v)),
            Value::Char(v) => Ok(*v as i128),
            Value::Null => Ok(0),
            _ => Err(EvalError::type_mismatch(format!(
                "cannot convert {} to a signed integer",
                self.kind_name()
            ))),
        }
    }

    /// Convert to float
    pub fn to_float(&self) -> Result<f64, EvalError> {
        match self {
            Value::Unsigned(v) => Ok(*v as f64),
            Value::Signed(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            Value::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Value::Char(v) => Ok(*v as u32 as f64),
            _ => Err(EvalError::type_mismatch(format!(
                "cannot convert {} to a float",
                self.kind_name()
            ))),
        }
    }

    /// Convert to boolean
    #[inline]
    pub fn to_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Unsigned(v) => Ok(*v != 0),
            Value::Signed(v) => Ok(*v != 0),
            Value::Float(v) => Ok(*v != 0.0),
            Value::Bool(v) => Ok(*v),
            Value::Char(v) => Ok(*v != '\0'),
            Value::String(s) => Ok(!s.is_empty()),
            Value::Null => Ok(false),
            Value::Pattern(_) => Ok(true),
        }
    }

    pub fn as_str(&self) -> Result<&str, EvalError> {
        match self {
            Value::String(s) => Ok(s),
            _ => Err(EvalError::type_mismatch(format!(
                "expected a string, got {}",
                self.kind_name()
            ))),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Unsigned(_) | Value::Signed(_) | Value::Float(_)
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Unsigned(_) => "unsigned integer",
            Value::Signed(_) => "signed integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::Null => "null",
            Value::Pattern(_) => "pattern",
        }
    }

    /// Truncate or convert to the representation of a built-in type
    pub fn narrow(&self, ty: Builtin) -> Result<Value, EvalError> {
        Ok(match ty {
            Builtin::Unsigned(bytes) => Value::Unsigned(truncate(self.to_unsigned()?, bytes)),
            Builtin::Signed(bytes) => Value::Signed(sign_extend(truncate(self.to_unsigned()?, bytes), bytes)),
            Builtin::Float => Value::Float(self.to_float()? as f32 as f64),
            Builtin::Double => Value::Float(self.to_float()?),
            Builtin::Bool => Value::Bool(self.to_bool()?),
            Builtin::Char => Value::Char((self.to_unsigned()? & 0xFF) as u8 as char),
            Builtin::Char16 => {
                Value::Char(char::from_u32((self.to_unsigned()? & 0xFFFF) as u32).unwrap_or('\u{FFFD}'))
            }
            Builtin::Str => match self {
                Value::String(_) => self.clone(),
                Value::Char(c) => Value::String(c.to_string()),
                other => Value::String(other.to_string()),
            },
            Builtin::Auto | Builtin::Padding => self.clone(),
        })
    }
}

/// Keep the low `bytes` bytes of `v`
pub fn truncate(v: u128, bytes: u8) -> u128 {
    if bytes >= 16 {
        v
    } else {
        v & ((1u128 << (bytes as u32 * 8)) - 1)
    }
}

/// Interpret the low `bytes` bytes of `v` as two's complement
pub fn sign_extend(v: u128, bytes: u8) -> i128 {
    if bytes >= 16 {
        return v as i128;
    }
    let shift = 128 - bytes as u32 * 8;
    ((v << shift) as i128) >> shift
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
            Value::Null => f.write_str("null"),
            Value::Pattern(id) => write!(f, "<pattern {}>", id.0),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unsigned(a), Value::Unsigned(b)) => a == b,
            (Value::Signed(a), Value::Signed(b)) => a == b,
            (Value::Unsigned(a), Value::Signed(b)) | (Value::Signed(b), Value::Unsigned(a)) => {
                *b >= 0 && *a == *b as u128
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Pattern(a), Value::Pattern(b)) => a == b,
            _ => false,
        }
    }
}
