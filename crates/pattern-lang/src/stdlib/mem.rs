// std::mem - reading the data source and managing sections

use super::{arg, arg_string, arg_u128, arg_u64, section_arg};
use crate::error::{ErrorCode, EvalError};
use crate::eval::native::NativeContext;
use crate::eval::value::{self, Value};
use crate::registry::{native, Arity, ExtensionRegistry, RegistryError};
use crate::section::SectionId;
use crate::types::Endian;
use memchr::memmem;

const NS: &str = "std::mem";

/// Optional endian argument: 1 or "big" is big, 2 or "little" is little,
/// anything else uses the program's default
fn endian_arg(ctx: &NativeContext<'_>, args: &[Value], i: usize) -> Result<Endian, EvalError> {
    if args.len() <= i {
        return Ok(ctx.settings.endian);
    }
    Ok(match arg(ctx, args, i)? {
        Value::String(s) => Endian::parse(&s).unwrap_or(ctx.settings.endian),
        v => match v.to_unsigned()? {
            1 => Endian::Big,
            2 => Endian::Little,
            _ => ctx.settings.endian,
        },
    })
}

/// Read a `size` byte integer from the provider
fn read_int(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<(u128, u8), EvalError> {
    let address = arg_u64(ctx, args, 0)?;
    let size = arg_u64(ctx, args, 1)?;
    if !(1..=16).contains(&size) {
        return Err(EvalError::new(
            ErrorCode::NativeFailure,
            format!("read size must be between 1 and 16 bytes, got {}", size),
        ));
    }
    let endian = endian_arg(ctx, args, 2)?;
    let mut buf = [0u8; 16];
    ctx.read(SectionId::PROVIDER, address, &mut buf[..size as usize])?;
    let bytes = &buf[..size as usize];
    let push = |acc: u128, b: &u8| (acc << 8) | u128::from(*b);
    let v = match endian {
        Endian::Little => bytes.iter().rev().fold(0, push),
        Endian::Big => bytes.iter().fold(0, push),
    };
    Ok((v, size as u8))
}

const SCAN_CHUNK: u64 = 0x10000;

/// Address of the `occurrence`-th non-overlapping match of `needle` in the
/// provider. The provider is read one chunk at a time; each chunk carries
/// `needle.len() - 1` extra bytes so matches crossing a boundary are seen.
fn find_sequence(
    ctx: &mut NativeContext<'_>,
    needle: &[u8],
    occurrence: u64,
) -> Result<Option<u64>, EvalError> {
    let finder = memmem::Finder::new(needle);
    let overlap = needle.len().saturating_sub(1) as u64;
    let end = ctx.data.end();
    let mut remaining = occurrence;
    let mut at = ctx.data.base();
    // earliest address the next match may start at
    let mut next = at;
    let mut buf = Vec::new();
    while at < end {
        let owned = SCAN_CHUNK.min(end - at) as usize;
        buf.resize((SCAN_CHUNK + overlap).min(end - at) as usize, 0);
        ctx.read(SectionId::PROVIDER, at, &mut buf)?;
        let mut from = next.saturating_sub(at) as usize;
        while from < owned {
            let Some(i) = finder.find(&buf[from..]) else {
                break;
            };
            let start = from + i;
            if start >= owned {
                break;
            }
            if remaining == 0 {
                return Ok(Some(at + start as u64));
            }
            remaining -= 1;
            from = start + needle.len();
            next = at + from as u64;
        }
        ctx.check_abort()?;
        at = at.saturating_add(SCAN_CHUNK);
    }
    Ok(None)
}

pub fn register(r: &mut ExtensionRegistry) -> Result<(), RegistryError> {
    r.add_function(NS, "base_address", Arity::Exactly(0), native(|ctx, _| {
        Ok(Value::Unsigned(ctx.data.base() as u128))
    }))?;

    r.add_function(NS, "size", Arity::Exactly(0), native(|ctx, _| {
        Ok(Value::Unsigned(ctx.data.size() as u128))
    }))?;

    r.add_function(NS, "eof", Arity::Exactly(0), native(|ctx, _| {
        Ok(Value::Bool(ctx.cursor >= ctx.data.end()))
    }))?;

    r.add_function(NS, "read_unsigned", Arity::Between(2, 3), native(|ctx, args| {
        let (v, _) = read_int(ctx, args)?;
        Ok(Value::Unsigned(v))
    }))?;

    r.add_function(NS, "read_signed", Arity::Between(2, 3), native(|ctx, args| {
        let (v, size) = read_int(ctx, args)?;
        Ok(Value::Signed(value::sign_extend(v, size)))
    }))?;

    r.add_function(NS, "read_string", Arity::Exactly(2), native(|ctx, args| {
        let address = arg_u64(ctx, args, 0)?;
        let len = arg_u64(ctx, args, 1)?;
        let bytes = ctx.read_vec(SectionId::PROVIDER, address, len)?;
        Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    }))?;

    // find_sequence(occurrence, bytes...): address of the n-th match or -1
    r.add_function(NS, "find_sequence", Arity::AtLeast(2), native(|ctx, args| {
        let occurrence = arg_u64(ctx, args, 0)?;
        let mut needle = Vec::with_capacity(args.len() - 1);
        for i in 1..args.len() {
            needle.push(arg_u128(ctx, args, i)? as u8);
        }
        Ok(match find_sequence(ctx, &needle, occurrence)? {
            Some(address) => Value::Unsigned(address as u128),
            None => Value::Signed(-1),
        })
    }))?;

    r.add_function(NS, "create_section", Arity::Exactly(1), native(|ctx, args| {
        let name = arg_string(ctx, args, 0)?;
        Ok(Value::Unsigned(ctx.sections.create(name).0 as u128))
    }))?;

    r.add_function(NS, "delete_section", Arity::Exactly(1), native(|ctx, args| {
        let id = section_arg(ctx, args, 0)?;
        match ctx.sections.remove(id) {
            Some(_) => Ok(Value::Null),
            None => Err(EvalError::new(
                ErrorCode::NativeFailure,
                format!("section {} does not exist", id.0),
            )),
        }
    }))?;

    r.add_function(NS, "get_section_size", Arity::Exactly(1), native(|ctx, args| {
        let id = section_arg(ctx, args, 0)?;
        Ok(Value::Unsigned(ctx.section_size(id)? as u128))
    }))?;

    // copy_to_section(from_section, from_address, to_section, to_address, size)
    r.add_function(NS, "copy_to_section", Arity::Exactly(5), native(|ctx, args| {
        let from = section_arg(ctx, args, 0)?;
        let from_address = arg_u64(ctx, args, 1)?;
        let to = section_arg(ctx, args, 2)?;
        let to_address = arg_u64(ctx, args, 3)?;
        let size = arg_u64(ctx, args, 4)?;
        if to == SectionId::PROVIDER {
            return Err(EvalError::new(
                ErrorCode::NativeFailure,
                "the main data cannot be written through sections",
            ));
        }
        let bytes = ctx.read_vec(from, from_address, size)?;
        ctx.sections.write(to, to_address, &bytes)?;
        Ok(Value::Null)
    }))?;

    Ok(())
}
