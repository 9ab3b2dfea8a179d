// std::print, std::format and the other console functions

use super::{arg, arg_string};
use crate::error::{ErrorCode, EvalError};
use crate::eval::native::NativeContext;
use crate::eval::value::Value;
use crate::log::LogLevel;
use crate::registry::{native, Arity, ExtensionRegistry, NativeFn, RegistryError};

/// `{}` style formatting. A placeholder is `{[index][:[#][0][width][type]]}`
/// where type is one of `x X b o d s`; `{{` and `}}` are literal braces.
pub fn format_values(fmt: &str, args: &[Value]) -> Result<String, EvalError> {
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    let mut next = 0usize;
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut spec = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => spec.push(c),
                        None => return Err(format_error("unterminated '{' in format string")),
                    }
                }
                let (index, options) = match spec.split_once(':') {
                    Some((index, options)) => (index, options),
                    None => (spec.as_str(), ""),
                };
                let index = if index.is_empty() {
                    next += 1;
                    next - 1
                } else {
                    index
                        .parse()
                        .map_err(|_| format_error(format!("invalid argument index '{}'", index)))?
                };
                let value = args.get(index).ok_or_else(|| {
                    format_error(format!("format string refers to missing argument {}", index))
                })?;
                out.push_str(&format_one(value, options)?);
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn format_error(message: impl Into<String>) -> EvalError {
    EvalError::new(ErrorCode::NativeFailure, message)
}

fn format_one(value: &Value, options: &str) -> Result<String, EvalError> {
    let mut rest = options;
    let alternate = rest.starts_with('#');
    if alternate {
        rest = &rest[1..];
    }
    let zero = rest.starts_with('0');
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    let width: usize = rest[..digits].parse().unwrap_or(0);
    let kind = &rest[digits..];

    let body = match kind {
        "" | "s" | "d" => match (kind, value) {
            ("d", v) => v.to_signed()?.to_string(),
            _ => value.to_string(),
        },
        "x" | "X" | "b" | "o" => {
            let v = value.to_unsigned()?;
            let (digits, prefix) = match kind {
                "x" => (format!("{:x}", v), "0x"),
                "X" => (format!("{:X}", v), "0X"),
                "b" => (format!("{:b}", v), "0b"),
                _ => (format!("{:o}", v), "0o"),
            };
            if alternate {
                let pad = width.saturating_sub(prefix.len());
                return Ok(if zero {
                    format!("{}{:0>pad$}", prefix, digits, pad = pad)
                } else {
                    format!("{:>width$}", format!("{}{}", prefix, digits), width = width)
                });
            }
            digits
        }
        other => return Err(format_error(format!("unknown format type '{}'", other))),
    };
    Ok(if zero {
        format!("{:0>width$}", body, width = width)
    } else {
        format!("{:>width$}", body, width = width)
    })
}

fn formatted(ctx: &NativeContext<'_>, args: &[Value]) -> Result<String, EvalError> {
    let fmt = arg_string(ctx, args, 0)?;
    let mut values = Vec::with_capacity(args.len().saturating_sub(1));
    for i in 1..args.len() {
        values.push(arg(ctx, args, i)?);
    }
    format_values(&fmt, &values)
}

fn print() -> NativeFn {
    native(|ctx, args| {
        let text = formatted(ctx, args)?;
        ctx.log(LogLevel::Info, text);
        Ok(Value::Null)
    })
}

fn format() -> NativeFn {
    native(|ctx, args| Ok(Value::String(formatted(ctx, args)?)))
}

pub fn register(r: &mut ExtensionRegistry) -> Result<(), RegistryError> {
    r.add_function("std", "print", Arity::AtLeast(1), print())?;
    r.add_function("std", "format", Arity::AtLeast(1), format())?;
    r.add_function("std::io", "print", Arity::AtLeast(1), print())?;
    r.add_function("std::io", "format", Arity::AtLeast(1), format())?;

    r.add_function("std", "warning", Arity::Exactly(1), native(|ctx, args| {
        let message = arg_string(ctx, args, 0)?;
        ctx.log(LogLevel::Warning, message);
        Ok(Value::Null)
    }))?;

    r.add_function("std", "error", Arity::Exactly(1), native(|ctx, args| {
        Err(EvalError::new(ErrorCode::NativeFailure, arg_string(ctx, args, 0)?))
    }))?;

    r.add_function("std", "assert", Arity::Exactly(2), native(|ctx, args| {
        if arg(ctx, args, 0)?.to_bool()? {
            Ok(Value::Null)
        } else {
            Err(EvalError::new(
                ErrorCode::Assertion,
                format!("assertion failed: {}", arg_string(ctx, args, 1)?),
            ))
        }
    }))?;

    r.add_function("std", "assert_warn", Arity::Exactly(2), native(|ctx, args| {
        if !arg(ctx, args, 0)?.to_bool()? {
            let message = arg_string(ctx, args, 1)?;
            ctx.log(LogLevel::Warning, format!("assertion failed: {}", message));
        }
        Ok(Value::Null)
    }))?;

    r.add_function("std", "env", Arity::Exactly(1), native(|ctx, args| {
        let name = arg_string(ctx, args, 0)?;
        ctx.env.get(&name).cloned().ok_or_else(|| {
            EvalError::new(
                ErrorCode::UndefinedName,
                format!("environment variable '{}' is not set", name),
            )
        })
    }))?;

    Ok(())
}
