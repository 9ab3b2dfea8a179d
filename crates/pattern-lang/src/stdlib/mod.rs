// Standard library for the pattern language
//
// Everything here is an ordinary native extension registered under `std`;
// hosts add their own functions the same way.

mod core;
mod dec;
mod file;
mod io;
mod math;
mod mem;
mod string;

use crate::error::{ErrorCode, EvalError};
use crate::eval::native::NativeContext;
use crate::eval::value::Value;
use crate::pattern::PatternId;
use crate::section::SectionId;
use crate::registry::{ExtensionRegistry, RegistryError};

pub fn register(registry: &mut ExtensionRegistry) -> Result<(), RegistryError> {
    core::register(registry)?;
    mem::register(registry)?;
    io::register(registry)?;
    string::register(registry)?;
    math::register(registry)?;
    file::register(registry)?;
    dec::register(registry)?;
    Ok(())
}

/// Argument `i` as a scalar; pattern arguments are read back
fn arg(ctx: &NativeContext<'_>, args: &[Value], i: usize) -> Result<Value, EvalError> {
    let value = args.get(i).ok_or_else(|| {
        EvalError::new(ErrorCode::ArityMismatch, format!("missing argument {}", i + 1))
    })?;
    ctx.scalar(value)
}

fn arg_u128(ctx: &NativeContext<'_>, args: &[Value], i: usize) -> Result<u128, EvalError> {
    arg(ctx, args, i)?.to_unsigned()
}

fn arg_u64(ctx: &NativeContext<'_>, args: &[Value], i: usize) -> Result<u64, EvalError> {
    Ok(u64::try_from(arg_u128(ctx, args, i)?).unwrap_or(u64::MAX))
}

fn arg_string(ctx: &NativeContext<'_>, args: &[Value], i: usize) -> Result<String, EvalError> {
    Ok(match arg(ctx, args, i)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn pattern_arg(args: &[Value], i: usize, function: &str) -> Result<PatternId, EvalError> {
    match args.get(i) {
        Some(Value::Pattern(id)) => Ok(*id),
        Some(other) => Err(EvalError::type_mismatch(format!(
            "{} expects placed data, got a {}",
            function,
            other.kind_name()
        ))),
        None => Err(EvalError::new(
            ErrorCode::ArityMismatch,
            format!("{} is missing an argument", function),
        )),
    }
}

fn section_arg(ctx: &NativeContext<'_>, args: &[Value], i: usize) -> Result<SectionId, EvalError> {
    Ok(SectionId(arg_u64(ctx, args, i)?))
}
