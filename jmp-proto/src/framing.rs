use crate::messages::JmpMessage;
use crate::stream::{Fill, StreamBuffer};
use crate::{ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Maximum frame size (10MB for safety)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Default maximum frame size for most deployments (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Longest length field we will buffer before declaring the header bogus.
/// Protects against an attacker feeding an endless digit run.
const MAX_LENGTH_DIGITS: usize = 20;

/// Extracts JMP frames from a [`StreamBuffer`].
///
/// The wire grammar is `'[' <digits>+ ',' <payload-bytes> ']'` where the
/// digits give the exact byte length of the payload. Frames sit back-to-back
/// in the stream; stray bytes between frames are discarded, never fatal.
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Attempts to decode one frame from the buffered bytes.
    ///
    /// Returns `Ok(None)` when more data is needed; no bytes of a partial
    /// frame are consumed in that case, so the caller can simply refill the
    /// buffer and retry. Malformed headers are fatal for the connection.
    pub fn decode(&self, buf: &mut StreamBuffer) -> Result<Option<String>> {
        // anything before the opening bracket is noise
        match buf.pending().iter().position(|&b| b == b'[') {
            None => {
                let n = buf.available();
                if n > 0 {
                    trace!("discarding {} stray bytes", n);
                    buf.consume(n);
                }
                return Ok(None);
            }
            Some(0) => {}
            Some(i) => {
                trace!("discarding {} stray bytes before frame", i);
                buf.consume(i);
            }
        }

        let pending = buf.pending();

        let mut idx = 1;
        while idx < pending.len() && pending[idx].is_ascii_digit() {
            idx += 1;
        }
        if idx == pending.len() {
            if idx > MAX_LENGTH_DIGITS {
                return Err(ProtocolError::InvalidFrame(
                    "unterminated length field".to_string(),
                ));
            }
            return Ok(None);
        }

        if pending[idx] != b',' {
            return Err(ProtocolError::InvalidFrame(format!(
                "comma expected after length, got 0x{:02x}",
                pending[idx]
            )));
        }

        let length: usize = std::str::from_utf8(&pending[1..idx])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| ProtocolError::InvalidFrame("invalid length field".to_string()))?;

        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(length, self.max_frame_size));
        }

        // '[' digits ',' payload ']'
        let frame_size = idx + 1 + length + 1;
        if pending.len() < frame_size {
            return Ok(None);
        }

        if pending[frame_size - 1] != b']' {
            return Err(ProtocolError::InvalidFrame(
                "right bracket expected".to_string(),
            ));
        }

        let payload = pending[idx + 1..idx + 1 + length].to_vec();
        buf.consume(frame_size);

        let text = String::from_utf8(payload)?;
        debug!("decoded frame of {} bytes", length);
        Ok(Some(text))
    }

    /// Pulls the next complete frame, reading from the transport as needed.
    ///
    /// Returns `Ok(None)` when the stream ends or the buffer is closed; a
    /// frame truncated by either is not reported as a protocol error.
    pub async fn next_frame<R>(
        &self,
        reader: &mut R,
        buf: &mut StreamBuffer,
    ) -> Result<Option<String>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if buf.is_closed() {
                return Ok(None);
            }
            if let Some(payload) = self.decode(buf)? {
                return Ok(Some(payload));
            }
            match buf.fill(reader).await? {
                Fill::Data(_) => {}
                Fill::Eof | Fill::Closed => return Ok(None),
            }
        }
    }
}

/// Wraps a payload in the JMP frame format `[<len>,<payload>]`.
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 16);
    frame.push(b'[');
    frame.extend_from_slice(payload.len().to_string().as_bytes());
    frame.push(b',');
    frame.extend_from_slice(payload.as_bytes());
    frame.push(b']');
    frame
}

/// Serializes a message and writes it as one frame.
pub async fn write_frame<W>(writer: &mut W, message: &JmpMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(message)?;
    debug!(
        "writing frame of {} bytes, message: {:?}",
        json.len(),
        message.message()
    );

    writer.write_all(&encode_frame(&json)).await?;
    writer.flush().await?;

    Ok(())
}
