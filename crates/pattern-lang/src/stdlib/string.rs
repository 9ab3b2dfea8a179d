// std::string - string manipulation functions

use super::{arg, arg_string, arg_u64};
use crate::error::{ErrorCode, EvalError};
use crate::eval::value::Value;
use crate::registry::{native, Arity, ExtensionRegistry, RegistryError};

const NS: &str = "std::string";

/// Parse an integer in `base`; base 0 detects `0x`, `0b` and `0o` prefixes
pub fn parse_int(text: &str, base: u32) -> Option<i128> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (base, digits) = match base {
        0 => {
            let lower = digits.get(..2).map(str::to_ascii_lowercase);
            match lower.as_deref() {
                Some("0x") => (16, &digits[2..]),
                Some("0b") => (2, &digits[2..]),
                Some("0o") => (8, &digits[2..]),
                _ => (10, digits),
            }
        }
        b if (2..=36).contains(&b) => (b, digits),
        _ => return None,
    };
    let magnitude = i128::from_str_radix(digits, base).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

pub fn register(r: &mut ExtensionRegistry) -> Result<(), RegistryError> {
    r.add_function(NS, "length", Arity::Exactly(1), native(|ctx, args| {
        Ok(Value::Unsigned(arg_string(ctx, args, 0)?.chars().count() as u128))
    }))?;

    r.add_function(NS, "at", Arity::Exactly(2), native(|ctx, args| {
        let s = arg_string(ctx, args, 0)?;
        let index = arg_u64(ctx, args, 1)?;
        s.chars().nth(index as usize).map(Value::Char).ok_or_else(|| {
            EvalError::new(
                ErrorCode::OutOfBounds,
                format!("index {} is out of range for length {}", index, s.chars().count()),
            )
        })
    }))?;

    r.add_function(NS, "substr", Arity::Exactly(3), native(|ctx, args| {
        let s = arg_string(ctx, args, 0)?;
        let start = arg_u64(ctx, args, 1)? as usize;
        let len = arg_u64(ctx, args, 2)? as usize;
        if start > s.chars().count() {
            return Err(EvalError::new(
                ErrorCode::OutOfBounds,
                format!("substring start {} is past the end of the string", start),
            ));
        }
        Ok(Value::String(s.chars().skip(start).take(len).collect()))
    }))?;

    r.add_function(NS, "to_upper", Arity::Exactly(1), native(|ctx, args| {
        Ok(Value::String(arg_string(ctx, args, 0)?.to_uppercase()))
    }))?;

    r.add_function(NS, "to_lower", Arity::Exactly(1), native(|ctx, args| {
        Ok(Value::String(arg_string(ctx, args, 0)?.to_lowercase()))
    }))?;

    r.add_function(NS, "contains", Arity::Exactly(2), native(|ctx, args| {
        let haystack = arg_string(ctx, args, 0)?;
        Ok(Value::Bool(haystack.contains(arg_string(ctx, args, 1)?.as_str())))
    }))?;

    r.add_function(NS, "starts_with", Arity::Exactly(2), native(|ctx, args| {
        let s = arg_string(ctx, args, 0)?;
        Ok(Value::Bool(s.starts_with(arg_string(ctx, args, 1)?.as_str())))
    }))?;

    r.add_function(NS, "ends_with", Arity::Exactly(2), native(|ctx, args| {
        let s = arg_string(ctx, args, 0)?;
        Ok(Value::Bool(s.ends_with(arg_string(ctx, args, 1)?.as_str())))
    }))?;

    r.add_function(NS, "parse_int", Arity::Between(1, 2), native(|ctx, args| {
        let text = arg_string(ctx, args, 0)?;
        let base = match args.len() {
            1 => 0,
            _ => arg(ctx, args, 1)?.to_unsigned()?.min(u128::from(u32::MAX)) as u32,
        };
        parse_int(&text, base).map(Value::Signed).ok_or_else(|| {
            EvalError::new(
                ErrorCode::NativeFailure,
                format!("'{}' is not a valid integer", text),
            )
        })
    }))?;

    Ok(())
}
