// hex::dec - decoders that unpack placed data into sections

use super::{pattern_arg, section_arg};
use crate::error::{ErrorCode, EvalError};
use crate::eval::value::Value;
use crate::registry::{native, Arity, ExtensionRegistry, RegistryError};
use crate::section::SectionId;
use miniz_oxide::inflate::{self, TINFLStatus};

const NS: &str = "hex::dec";

pub fn register(r: &mut ExtensionRegistry) -> Result<(), RegistryError> {
    // zlib_decompress(pattern, section): replaces the section's bytes with
    // the inflated data and returns how many bytes that was
    r.add_function(NS, "zlib_decompress", Arity::Exactly(2), native(|ctx, args| {
        let id = pattern_arg(args, 0, "zlib_decompress")?;
        let target = section_arg(ctx, args, 1)?;
        if target == SectionId::PROVIDER {
            return Err(EvalError::new(
                ErrorCode::PermissionDenied,
                "the main data cannot be written through sections",
            ));
        }
        // Fail on a missing section before inflating anything
        ctx.sections.size(target)?;

        let (section, offset, size) = ctx.pattern_range(id)?;
        let compressed = ctx.read_vec(section, offset, size)?;
        ctx.check_abort()?;

        let limit = ctx.sections.size_limit();
        let max_size = usize::try_from(limit).unwrap_or(usize::MAX);
        let data = inflate::decompress_to_vec_zlib_with_limit(&compressed, max_size).map_err(|e| {
            if e.status == TINFLStatus::HasMoreOutput {
                EvalError::new(
                    ErrorCode::OutOfBounds,
                    format!("decompressed data does not fit the section limit of 0x{:X}", limit),
                )
            } else {
                EvalError::new(
                    ErrorCode::NativeFailure,
                    format!("zlib decompression failed: {:?}", e.status),
                )
            }
        })?;

        if let Some(s) = ctx.sections.get_mut(target) {
            s.data.clear();
        }
        ctx.sections.write(target, 0, &data)?;
        Ok(Value::Unsigned(data.len() as u128))
    }))?;

    Ok(())
}
