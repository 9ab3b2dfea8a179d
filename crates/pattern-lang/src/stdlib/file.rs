// std::file - host file access, gated behind the dangerous-function policy
//
// Open files live in the run's file table; handles restart at 1 every run
// and whatever the program leaves open is closed when the run ends.

use super::{arg, arg_string, arg_u128, arg_u64};
use crate::error::{ErrorCode, EvalError};
use crate::eval::value::Value;
use crate::registry::{native, Arity, ExtensionRegistry, RegistryError};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

const NS: &str = "std::file";

fn io_error(action: &str, e: std::io::Error) -> EvalError {
    EvalError::new(ErrorCode::NativeFailure, format!("{} failed: {}", action, e))
}

pub fn register(r: &mut ExtensionRegistry) -> Result<(), RegistryError> {
    // open(path, mode): 1 read, 2 write, 3 create
    r.add_dangerous_function(NS, "open", Arity::Exactly(2), native(|ctx, args| {
        let path = arg_string(ctx, args, 0)?;
        let mode = arg_u128(ctx, args, 1)?;
        let mut options = OpenOptions::new();
        match mode {
            1 => options.read(true),
            2 => options.read(true).write(true),
            3 => options.read(true).write(true).create(true).truncate(true),
            other => {
                return Err(EvalError::new(
                    ErrorCode::NativeFailure,
                    format!("invalid file mode {}", other),
                ))
            }
        };
        let file = options.open(&path).map_err(|e| io_error("opening a file", e))?;
        tracing::debug!(target: "pattern_lang::stdlib", path = %path, mode = mode as u64, "file opened");
        Ok(Value::Unsigned(ctx.files.insert(path, file)))
    }))?;

    r.add_dangerous_function(NS, "close", Arity::Exactly(1), native(|ctx, args| {
        let handle = arg_u128(ctx, args, 0)?;
        ctx.files.remove(handle)?;
        Ok(Value::Null)
    }))?;

    // read(handle, size): up to `size` bytes from the file position as a string
    r.add_dangerous_function(NS, "read", Arity::Exactly(2), native(|ctx, args| {
        let handle = arg_u128(ctx, args, 0)?;
        let size = arg_u64(ctx, args, 1)?;
        let file = ctx.files.get_mut(handle)?;
        let mut bytes = Vec::new();
        file.take(size)
            .read_to_end(&mut bytes)
            .map_err(|e| io_error("reading a file", e))?;
        Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    }))?;

    // write(handle, data): strings are written as bytes, integers as one byte
    r.add_dangerous_function(NS, "write", Arity::Exactly(2), native(|ctx, args| {
        let handle = arg_u128(ctx, args, 0)?;
        let bytes = match arg(ctx, args, 1)? {
            Value::String(s) => s.into_bytes(),
            Value::Char(c) => c.to_string().into_bytes(),
            other => vec![other.to_unsigned()? as u8],
        };
        let file = ctx.files.get_mut(handle)?;
        file.write_all(&bytes).map_err(|e| io_error("writing a file", e))?;
        Ok(Value::Null)
    }))?;

    r.add_dangerous_function(NS, "seek", Arity::Exactly(2), native(|ctx, args| {
        let handle = arg_u128(ctx, args, 0)?;
        let offset = arg_u64(ctx, args, 1)?;
        let file = ctx.files.get_mut(handle)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| io_error("seeking a file", e))?;
        Ok(Value::Null)
    }))?;

    r.add_dangerous_function(NS, "size", Arity::Exactly(1), native(|ctx, args| {
        let handle = arg_u128(ctx, args, 0)?;
        let file = ctx.files.get_mut(handle)?;
        let len = file
            .metadata()
            .map_err(|e| io_error("querying a file", e))?
            .len();
        Ok(Value::Unsigned(len as u128))
    }))?;

    r.add_dangerous_function(NS, "resize", Arity::Exactly(2), native(|ctx, args| {
        let handle = arg_u128(ctx, args, 0)?;
        let size = arg_u64(ctx, args, 1)?;
        let file = ctx.files.get_mut(handle)?;
        file.set_len(size).map_err(|e| io_error("resizing a file", e))?;
        Ok(Value::Null)
    }))?;

    r.add_dangerous_function(NS, "flush", Arity::Exactly(1), native(|ctx, args| {
        let handle = arg_u128(ctx, args, 0)?;
        let file = ctx.files.get_mut(handle)?;
        file.flush().map_err(|e| io_error("flushing a file", e))?;
        Ok(Value::Null)
    }))?;

    // remove(handle): closes the file and deletes it from disk
    r.add_dangerous_function(NS, "remove", Arity::Exactly(1), native(|ctx, args| {
        let handle = arg_u128(ctx, args, 0)?;
        let open = ctx.files.remove(handle)?;
        drop(open.file);
        fs::remove_file(&open.path).map_err(|e| io_error("removing a file", e))?;
        tracing::debug!(target: "pattern_lang::stdlib", path = %open.path.display(), "file removed");
        Ok(Value::Null)
    }))?;

    Ok(())
}
