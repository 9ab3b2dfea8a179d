// std::core - functions that inspect patterns

use super::{arg_string, pattern_arg};
use crate::error::EvalError;
use crate::eval::value::Value;
use crate::pattern::PatternValue;
use crate::registry::{native, Arity, ExtensionRegistry, RegistryError};
use crate::section::Region;
use crate::types::{Builtin, TypeSpec};
use std::sync::Arc;

const NS: &str = "std::core";

pub fn register(r: &mut ExtensionRegistry) -> Result<(), RegistryError> {
    // add_virtual_file(path, pattern): expose the pattern's bytes as a file
    r.add_function(NS, "add_virtual_file", Arity::Exactly(2), native(|ctx, args| {
        let path = arg_string(ctx, args, 0)?;
        let id = pattern_arg(args, 1, "add_virtual_file")?;
        let (section, offset, size) = ctx.pattern_range(id)?;
        let data = ctx.read_vec(section, offset, size)?;
        ctx.sections.add_virtual_file(
            path,
            data,
            Region {
                section,
                offset,
                size,
            },
        );
        Ok(Value::Null)
    }))?;

    r.add_function(NS, "is_valid_enum", Arity::Exactly(1), native(|ctx, args| {
        let id = pattern_arg(args, 0, "is_valid_enum")?;
        let p = ctx
            .tree
            .get(id)
            .ok_or_else(|| EvalError::type_mismatch("stale pattern reference"))?;
        match &p.value {
            PatternValue::Enum { member, .. } => Ok(Value::Bool(member.is_some())),
            _ => Err(EvalError::type_mismatch(format!(
                "'{}' of type '{}' is not an enum",
                p.name, p.type_name
            ))),
        }
    }))?;

    // std::type::Bytes<N> is u8[N]
    r.add_type(
        "std::type",
        "Bytes",
        Arity::Exactly(1),
        Arc::new(|args: &[Value]| -> Result<TypeSpec, String> {
            let n = args
                .first()
                .ok_or("Bytes needs a size")?
                .to_unsigned()
                .map_err(|e| e.message)?;
            let n = u64::try_from(n).map_err(|_| format!("Bytes<{}> is too large", n))?;
            Ok(TypeSpec::Array(Box::new(TypeSpec::Builtin(Builtin::Unsigned(1))), n))
        }),
    )?;

    Ok(())
}
