use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TransportError;

/// Blocking byte pipe to the client.
///
/// The command loop always asks for an exact byte count; adapters are
/// responsible for gathering as many bulk transfers as that takes.
pub trait Transport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_exact(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(data)
    }
}

/// Flag another thread can raise to stop the command loop between reads.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        ShutdownHandle::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// In-memory transport: reads from a prepared input buffer and records
/// everything written. Running out of input reads as a disconnect.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    input: Vec<u8>,
    pos: usize,
    output: Vec<u8>,
}

impl MemoryTransport {
    pub fn new(input: Vec<u8>) -> Self {
        MemoryTransport {
            input,
            pos: 0,
            output: Vec::new(),
        }
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn into_output(self) -> Vec<u8> {
        self.output
    }

    /// Bytes of input not consumed yet.
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }
}

impl Transport for MemoryTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let end = self.pos + buf.len();
        let src = self
            .input
            .get(self.pos..end)
            .ok_or(TransportError::Disconnected)?;
        buf.copy_from_slice(src);
        self.pos = end;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.output.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_transport_reads_exact_and_reports_disconnect() {
        let mut t = MemoryTransport::new(vec![1, 2, 3]);
        let mut buf = [0u8; 2];
        t.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert!(matches!(
            t.read_exact(&mut buf),
            Err(TransportError::Disconnected)
        ));
        t.write_all(b"ok").unwrap();
        assert_eq!(t.output(), b"ok");
    }

    #[test]
    fn shutdown_handle_is_shared_between_clones() {
        let handle = ShutdownHandle::new();
        let other = handle.clone();
        assert!(!other.is_requested());
        handle.request();
        assert!(other.is_requested());
    }
}
