//! Read accumulation buffer shared by the plain and TLS transports.
//!
//! One buffer serves both modes. It is bound to a [`TransportMode`] when a
//! connection is established and refuses to be rebound to the other one.

use crate::config::TransportMode;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct ReadBuffer {
    mode: Option<TransportMode>,
    /// Fixed-capacity slot a single read lands in.
    raw: Box<[u8]>,
    /// Bytes received but not yet consumed by the framer.
    stream: Vec<u8>,
}

impl ReadBuffer {
    pub fn new(read_chunk_size: usize) -> Self {
        Self {
            mode: None,
            raw: vec![0u8; read_chunk_size.max(1)].into_boxed_slice(),
            stream: Vec::new(),
        }
    }

    /// Binds the buffer to `mode`. Rebinding to the same mode is a no-op.
    pub fn bind(&mut self, mode: TransportMode) -> Result<()> {
        match self.mode {
            Some(bound) if bound != mode => Err(Error::Configuration(format!(
                "read buffer is bound to {:?}, cannot switch to {:?}",
                bound, mode
            ))),
            _ => {
                self.mode = Some(mode);
                Ok(())
            }
        }
    }

    pub fn mode(&self) -> Option<TransportMode> {
        self.mode
    }

    pub fn active_stream(&mut self) -> &mut Vec<u8> {
        &mut self.stream
    }

    pub fn active_raw_slot(&mut self) -> &mut [u8] {
        &mut self.raw
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.stream.extend_from_slice(bytes);
    }

    /// Appends the first `n` bytes of the raw slot to the stream.
    pub fn commit(&mut self, n: usize) {
        let n = n.min(self.raw.len());
        self.stream.extend_from_slice(&self.raw[..n]);
    }

    /// Drops `n` bytes from the front of the stream.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.stream.len());
        self.stream.drain(..n);
    }

    pub fn len(&self) -> usize {
        self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    /// Discards unconsumed bytes. The mode binding is kept.
    pub fn clear(&mut self) {
        self.stream.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_bind_same_mode_twice() {
        let mut buffer = ReadBuffer::new(16);
        buffer.bind(TransportMode::Tls).unwrap();
        buffer.bind(TransportMode::Tls).unwrap();
        assert_eq!(buffer.mode(), Some(TransportMode::Tls));
    }

    #[test]
    fn test_bind_other_mode_is_rejected() {
        let mut buffer = ReadBuffer::new(16);
        buffer.bind(TransportMode::Plain).unwrap();
        let err = buffer.bind(TransportMode::Tls).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert_eq!(buffer.mode(), Some(TransportMode::Plain));
    }

    #[test]
    fn test_commit_from_raw_slot() {
        let mut buffer = ReadBuffer::new(8);
        assert_eq!(buffer.active_raw_slot().len(), 8);

        buffer.active_raw_slot()[..4].copy_from_slice(b"<msg");
        buffer.commit(4);
        buffer.active_raw_slot()[..8].copy_from_slice(b" id='1'/");
        buffer.commit(8);
        buffer.append(b">");

        assert_eq!(buffer.active_stream().as_slice(), b"<msg id='1'/>");
    }

    #[test]
    fn test_consume_and_clear() {
        let mut buffer = ReadBuffer::new(8);
        buffer.bind(TransportMode::Plain).unwrap();
        buffer.append(b"<a/><b/>");
        buffer.consume(4);
        assert_eq!(buffer.active_stream().as_slice(), b"<b/>");
        buffer.consume(100);
        assert!(buffer.is_empty());

        buffer.append(b"junk");
        buffer.clear();
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.mode(), Some(TransportMode::Plain));
    }
}
