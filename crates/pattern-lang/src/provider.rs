// Random-access byte stores the runtime reads patterns from

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

/// Failure of a provider read or write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// `offset + len` is outside `[base, base + size)`
    OutOfBounds { offset: u64, len: u64, end: u64 },
    ReadOnly,
    Unavailable,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::OutOfBounds { offset, len, end } => write!(
                f,
                "access of {} bytes at 0x{:X} is out of bounds (end is 0x{:X})",
                len, offset, end
            ),
            ProviderError::ReadOnly => f.write_str("provider is not writable"),
            ProviderError::Unavailable => f.write_str("provider is not available"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Identity of an attached provider, used to key per-provider state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(pub u64);

impl ProviderId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ProviderId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider-{}", self.0)
    }
}

/// Called with `(absolute offset, length)` after bytes change
pub type WriteObserver = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Abstract byte store. Offsets are absolute addresses: the first valid
/// byte lives at `base_address()`.
pub trait Provider: Send + Sync {
    fn base_address(&self) -> u64;

    fn actual_size(&self) -> u64;

    fn is_available(&self) -> bool {
        true
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError>;

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), ProviderError> {
        let _ = (offset, data);
        Err(ProviderError::ReadOnly)
    }

    /// Register a write observer. Returns false when the provider never
    /// changes and therefore keeps no observers.
    fn observe(&self, observer: WriteObserver) -> bool {
        let _ = observer;
        false
    }

    fn read_vec(&self, offset: u64, len: u64) -> Result<Vec<u8>, ProviderError> {
        check_bounds(self.base_address(), self.actual_size(), offset, len)?;
        let mut buf = vec![0u8; len as usize];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }
}

/// Validate `[offset, offset + len)` against `[base, base + size)` and return
/// the offset relative to `base`.
pub fn check_bounds(base: u64, size: u64, offset: u64, len: u64) -> Result<usize, ProviderError> {
    let end = base.saturating_add(size);
    let oob = ProviderError::OutOfBounds { offset, len, end };
    if offset < base {
        return Err(oob);
    }
    match offset.checked_add(len) {
        Some(stop) if stop <= end => Ok((offset - base) as usize),
        _ => Err(oob),
    }
}

#[derive(Debug, Clone)]
struct Edit {
    at: usize,
    before: Vec<u8>,
    after: Vec<u8>,
}

#[derive(Default)]
struct Buffer {
    bytes: Vec<u8>,
    undo: Vec<Edit>,
    redo: Vec<Edit>,
}

/// Provider over an owned byte vector, with undo history for writes
pub struct MemoryProvider {
    base: u64,
    writable: bool,
    buffer: RwLock<Buffer>,
    observers: Mutex<Vec<WriteObserver>>,
}

impl MemoryProvider {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            base: 0,
            writable: true,
            buffer: RwLock::new(Buffer {
                bytes,
                ..Buffer::default()
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes
            .clone()
    }

    pub fn can_undo(&self) -> bool {
        !self.buffer.read().unwrap_or_else(PoisonError::into_inner).undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.buffer.read().unwrap_or_else(PoisonError::into_inner).redo.is_empty()
    }

    /// Revert the most recent write. Returns false when there is nothing to undo.
    pub fn undo(&self) -> bool {
        let changed = {
            let mut buf = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
            match buf.undo.pop() {
                Some(edit) => {
                    buf.bytes[edit.at..edit.at + edit.before.len()].copy_from_slice(&edit.before);
                    let range = (edit.at, edit.before.len());
                    buf.redo.push(edit);
                    Some(range)
                }
                None => None,
            }
        };
        match changed {
            Some((at, len)) => {
                self.notify(self.base + at as u64, len as u64);
                true
            }
            None => false,
        }
    }

    pub fn redo(&self) -> bool {
        let changed = {
            let mut buf = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
            match buf.redo.pop() {
                Some(edit) => {
                    buf.bytes[edit.at..edit.at + edit.after.len()].copy_from_slice(&edit.after);
                    let range = (edit.at, edit.after.len());
                    buf.undo.push(edit);
                    Some(range)
                }
                None => None,
            }
        };
        match changed {
            Some((at, len)) => {
                self.notify(self.base + at as u64, len as u64);
                true
            }
            None => false,
        }
    }

    fn notify(&self, offset: u64, len: u64) {
        let observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer(offset, len);
        }
    }
}

impl Provider for MemoryProvider {
    fn base_address(&self) -> u64 {
        self.base
    }

    fn actual_size(&self) -> u64 {
        self.buffer.read().unwrap_or_else(PoisonError::into_inner).bytes.len() as u64
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError> {
        let data = self.buffer.read().unwrap_or_else(PoisonError::into_inner);
        let at = check_bounds(self.base, data.bytes.len() as u64, offset, buf.len() as u64)?;
        buf.copy_from_slice(&data.bytes[at..at + buf.len()]);
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), ProviderError> {
        if !self.writable {
            return Err(ProviderError::ReadOnly);
        }
        {
            let mut buf = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
            let at = check_bounds(self.base, buf.bytes.len() as u64, offset, data.len() as u64)?;
            let before = buf.bytes[at..at + data.len()].to_vec();
            buf.bytes[at..at + data.len()].copy_from_slice(data);
            buf.undo.push(Edit {
                at,
                before,
                after: data.to_vec(),
            });
            buf.redo.clear();
        }
        self.notify(offset, data.len() as u64);
        Ok(())
    }

    fn observe(&self, observer: WriteObserver) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
        true
    }
}

type ReadShim = Box<dyn Fn(u64, &mut [u8]) + Send + Sync>;
type WriteShim = Box<dyn Fn(u64, &[u8]) + Send + Sync>;

/// Provider assembled from host callbacks, installed by `Runtime::set_data_source`
pub struct FnProvider {
    base: u64,
    size: u64,
    read: ReadShim,
    write: Option<WriteShim>,
}

impl FnProvider {
    pub fn new(base: u64, size: u64, read: ReadShim, write: Option<WriteShim>) -> Self {
        Self {
            base,
            size,
            read,
            write,
        }
    }
}

impl Provider for FnProvider {
    fn base_address(&self) -> u64 {
        self.base
    }

    fn actual_size(&self) -> u64 {
        self.size
    }

    fn is_writable(&self) -> bool {
        self.write.is_some()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError> {
        check_bounds(self.base, self.size, offset, buf.len() as u64)?;
        (self.read)(offset, buf);
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), ProviderError> {
        let write = self.write.as_ref().ok_or(ProviderError::ReadOnly)?;
        check_bounds(self.base, self.size, offset, data.len() as u64)?;
        write(offset, data);
        Ok(())
    }
}

/// Zero-length provider used before a data source is installed
pub struct EmptyProvider;

impl Provider for EmptyProvider {
    fn base_address(&self) -> u64 {
        0
    }

    fn actual_size(&self) -> u64 {
        0
    }

    fn is_available(&self) -> bool {
        false
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError> {
        check_bounds(0, 0, offset, buf.len() as u64).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_read_within_bounds() {
        let p = MemoryProvider::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 2];
        p.read(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
    }

    #[test]
    fn test_read_past_end_fails() {
        let p = MemoryProvider::new(vec![1, 2, 3, 4]);
        let err = p.read_vec(3, 2).unwrap_err();
        assert_eq!(
            err,
            ProviderError::OutOfBounds {
                offset: 3,
                len: 2,
                end: 4
            }
        );
    }

    #[test]
    fn test_read_honours_base() {
        let p = MemoryProvider::new(vec![0xAA, 0xBB]).with_base(0x1000);
        assert_eq!(p.read_vec(0x1001, 1).unwrap(), vec![0xBB]);
        assert!(p.read_vec(0, 1).is_err());
    }

    #[test]
    fn test_write_notifies_observers() {
        let p = MemoryProvider::new(vec![0; 8]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        assert!(p.observe(Box::new(move |off, len| sink.lock().unwrap().push((off, len)))));
        p.write(2, &[9, 9, 9]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(2, 3)]);
    }

    #[test]
    fn test_write_read_only_rejected() {
        let p = MemoryProvider::new(vec![0; 4]).read_only();
        assert_eq!(p.write(0, &[1]), Err(ProviderError::ReadOnly));
    }

    #[test]
    fn test_undo_redo() {
        let p = MemoryProvider::new(vec![0; 4]);
        p.write(1, &[7, 8]).unwrap();
        assert_eq!(p.snapshot(), vec![0, 7, 8, 0]);
        assert!(p.undo());
        assert_eq!(p.snapshot(), vec![0; 4]);
        assert!(p.redo());
        assert_eq!(p.snapshot(), vec![0, 7, 8, 0]);
        assert!(!p.redo());
    }

    #[test]
    fn test_fn_provider_shims() {
        let p = FnProvider::new(0, 16, Box::new(|off, buf| buf.fill(off as u8)), None);
        assert_eq!(p.read_vec(5, 2).unwrap(), vec![5, 5]);
        assert!(!p.is_writable());
        assert!(p.read_vec(15, 2).is_err());
    }

    #[test]
    fn test_check_bounds_overflow() {
        assert!(check_bounds(0, 10, u64::MAX, 2).is_err());
    }
}
