use crate::Result;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Initial capacity for the incoming byte buffer
const INITIAL_CAPACITY: usize = 4096;

/// Outcome of pulling more data from the transport
#[derive(Debug, PartialEq, Eq)]
pub enum Fill {
    /// This many new bytes were appended to the buffer
    Data(usize),
    /// The peer closed its end of the transport
    Eof,
    /// The buffer was closed locally (graceful shutdown, not an error)
    Closed,
}

/// Accumulates bytes read from the transport and exposes a cursor-based
/// read interface over them.
///
/// The buffer is compacted whenever the read cursor catches up with the end
/// of buffered data, so steady-state traffic does not grow memory without
/// bound. Closing the buffer (from any task, via [`CloseHandle`]) makes all
/// further reads report [`Fill::Closed`] instead of an error, which is how a
/// graceful shutdown is distinguished from a genuine I/O failure.
pub struct StreamBuffer {
    buf: BytesMut,
    read_pos: usize,
    closed: Arc<AtomicBool>,
}

/// Cloneable handle used to close a [`StreamBuffer`] from another task.
#[derive(Clone)]
pub struct CloseHandle(Arc<AtomicBool>);

impl CloseHandle {
    /// Marks the buffer closed. Idempotent.
    pub fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            read_pos: 0,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle that can close this buffer from another task.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(Arc::clone(&self.closed))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Appends newly received transport bytes to the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffered-but-unread byte count.
    pub fn available(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    /// The unread portion of the buffer.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.read_pos..]
    }

    /// Advances the read cursor past `n` bytes.
    ///
    /// When the cursor reaches the end of buffered data, both cursors reset
    /// and the backing storage is truncated.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.read_pos += n;
        if self.read_pos == self.buf.len() {
            self.buf.clear();
            self.read_pos = 0;
        }
    }

    /// Performs one read against the transport and appends whatever arrives.
    pub async fn fill<R>(&mut self, reader: &mut R) -> Result<Fill>
    where
        R: AsyncRead + Unpin,
    {
        if self.is_closed() {
            return Ok(Fill::Closed);
        }

        match reader.read_buf(&mut self.buf).await {
            Ok(0) => {
                if self.is_closed() {
                    Ok(Fill::Closed)
                } else {
                    trace!("transport reached end of stream");
                    Ok(Fill::Eof)
                }
            }
            Ok(n) => {
                trace!("buffered {} bytes ({} available)", n, self.available());
                Ok(Fill::Data(n))
            }
            // a read torn down by a local close is not a fault
            Err(_) if self.is_closed() => Ok(Fill::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns exactly `n` bytes, pulling more data from the transport as
    /// needed. Returns `None` if the stream ends or is closed first.
    pub async fn read_exact<R>(&mut self, reader: &mut R, n: usize) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        while self.available() < n {
            match self.fill(reader).await? {
                Fill::Data(_) => {}
                Fill::Eof | Fill::Closed => return Ok(None),
            }
        }
        let bytes = self.pending()[..n].to_vec();
        self.consume(n);
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_consume() {
        let mut buf = StreamBuffer::new();
        buf.append(b"hello world");

        assert_eq!(buf.available(), 11);
        assert_eq!(buf.pending(), b"hello world");

        buf.consume(6);
        assert_eq!(buf.available(), 5);
        assert_eq!(buf.pending(), b"world");
    }

    #[test]
    fn test_compaction_on_drain() {
        let mut buf = StreamBuffer::new();
        buf.append(b"abc");
        buf.consume(3);

        // cursor reached the end: storage truncated, cursors reset
        assert_eq!(buf.available(), 0);
        assert_eq!(buf.buf.len(), 0);
        assert_eq!(buf.read_pos, 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let buf = StreamBuffer::new();
        let handle = buf.close_handle();

        assert!(!buf.is_closed());
        handle.close();
        handle.close();
        assert!(buf.is_closed());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_fill_appends_transport_bytes() {
        let mut buf = StreamBuffer::new();
        let mut reader: &[u8] = b"payload";

        let outcome = buf.fill(&mut reader).await.unwrap();
        assert_eq!(outcome, Fill::Data(7));
        assert_eq!(buf.pending(), b"payload");

        // reader is exhausted now
        let outcome = buf.fill(&mut reader).await.unwrap();
        assert_eq!(outcome, Fill::Eof);
    }

    #[tokio::test]
    async fn test_fill_after_close_reports_closed() {
        let mut buf = StreamBuffer::new();
        buf.close_handle().close();

        let mut reader: &[u8] = b"ignored";
        let outcome = buf.fill(&mut reader).await.unwrap();
        assert_eq!(outcome, Fill::Closed);
    }

    #[tokio::test]
    async fn test_read_exact_blocks_until_satisfied() {
        let (mut client, mut server) = tokio::io::duplex(16);

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            // deliver in two fragments with a pause in between
            client.write_all(b"he").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            client.write_all(b"llo").await.unwrap();
        });

        let mut buf = StreamBuffer::new();
        let bytes = buf.read_exact(&mut server, 5).await.unwrap();
        assert_eq!(bytes.as_deref(), Some(b"hello".as_ref()));

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_exact_none_on_short_stream() {
        let mut reader: &[u8] = b"abc";
        let mut buf = StreamBuffer::new();

        let bytes = buf.read_exact(&mut reader, 10).await.unwrap();
        assert!(bytes.is_none());
    }
}
