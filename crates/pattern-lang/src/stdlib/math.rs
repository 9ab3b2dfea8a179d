// std::math - numeric helpers

use super::arg;
use crate::error::{ErrorCode, EvalError};
use crate::eval::compare;
use crate::eval::value::Value;
use crate::registry::{native, Arity, ExtensionRegistry, NativeFn, RegistryError};
use std::cmp::Ordering;

const NS: &str = "std::math";

fn extreme(keep: Ordering) -> NativeFn {
    native(move |ctx, args| {
        let a = arg(ctx, args, 0)?;
        let b = arg(ctx, args, 1)?;
        Ok(if compare(&b, &a)? == keep { b } else { a })
    })
}

fn float_fn(f: fn(f64) -> f64) -> NativeFn {
    native(move |ctx, args| Ok(Value::Float(f(arg(ctx, args, 0)?.to_float()?))))
}

fn logarithm(name: &'static str, f: fn(f64) -> f64) -> NativeFn {
    native(move |ctx, args| {
        let v = arg(ctx, args, 0)?.to_float()?;
        if v <= 0.0 {
            return Err(EvalError::new(
                ErrorCode::NativeFailure,
                format!("{} is only defined for positive values", name),
            ));
        }
        Ok(Value::Float(f(v)))
    })
}

pub fn register(r: &mut ExtensionRegistry) -> Result<(), RegistryError> {
    r.add_function(NS, "min", Arity::Exactly(2), extreme(Ordering::Less))?;
    r.add_function(NS, "max", Arity::Exactly(2), extreme(Ordering::Greater))?;

    r.add_function(NS, "abs", Arity::Exactly(1), native(|ctx, args| {
        Ok(match arg(ctx, args, 0)? {
            Value::Signed(v) => Value::Signed(v.wrapping_abs()),
            Value::Float(v) => Value::Float(v.abs()),
            v => Value::Unsigned(v.to_unsigned()?),
        })
    }))?;

    r.add_function(NS, "floor", Arity::Exactly(1), float_fn(f64::floor))?;
    r.add_function(NS, "ceil", Arity::Exactly(1), float_fn(f64::ceil))?;
    r.add_function(NS, "round", Arity::Exactly(1), float_fn(f64::round))?;
    r.add_function(NS, "sqrt", Arity::Exactly(1), float_fn(f64::sqrt))?;
    r.add_function(NS, "exp", Arity::Exactly(1), float_fn(f64::exp))?;

    for (name, f) in [
        ("sin", f64::sin as fn(f64) -> f64),
        ("cos", f64::cos),
        ("tan", f64::tan),
        ("asin", f64::asin),
        ("acos", f64::acos),
        ("atan", f64::atan),
        ("sinh", f64::sinh),
        ("cosh", f64::cosh),
        ("tanh", f64::tanh),
        ("asinh", f64::asinh),
        ("acosh", f64::acosh),
        ("atanh", f64::atanh),
    ] {
        r.add_function(NS, name, Arity::Exactly(1), float_fn(f))?;
    }

    r.add_function(NS, "atan2", Arity::Exactly(2), native(|ctx, args| {
        let y = arg(ctx, args, 0)?.to_float()?;
        let x = arg(ctx, args, 1)?.to_float()?;
        Ok(Value::Float(y.atan2(x)))
    }))?;

    // Remainder with the sign of the dividend, like C's fmod
    r.add_function(NS, "fmod", Arity::Exactly(2), native(|ctx, args| {
        let x = arg(ctx, args, 0)?.to_float()?;
        let y = arg(ctx, args, 1)?.to_float()?;
        Ok(Value::Float(x % y))
    }))?;

    r.add_function(NS, "ln", Arity::Exactly(1), logarithm("ln", f64::ln))?;
    r.add_function(NS, "log2", Arity::Exactly(1), logarithm("log2", f64::log2))?;
    r.add_function(NS, "log10", Arity::Exactly(1), logarithm("log10", f64::log10))?;

    // Integer bases with small exponents stay integers
    r.add_function(NS, "pow", Arity::Exactly(2), native(|ctx, args| {
        let base = arg(ctx, args, 0)?;
        let exp = arg(ctx, args, 1)?;
        let int_exp = match exp {
            Value::Unsigned(e) => u32::try_from(e).ok(),
            _ => None,
        };
        Ok(match (base, int_exp) {
            (Value::Unsigned(b), Some(e)) => Value::Unsigned(b.wrapping_pow(e)),
            (Value::Signed(b), Some(e)) => Value::Signed(b.wrapping_pow(e)),
            (base, _) => Value::Float(base.to_float()?.powf(exp.to_float()?)),
        })
    }))?;

    Ok(())
}
