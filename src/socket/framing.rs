//! Wire protocol codec for the worker socket.
//!
//! Length-prefixed frames with a kind byte:
//!
//! ```text
//! [u32 LE length] [u8 kind] [payload: length-1 bytes]
//! ```
//!
//! Frame kinds:
//! - `0x01`: data (UTF-8 text: the request, or one result item)
//! - `0x02`: control (UTF-8 marker text, see [`Marker`])
//! - `0x03`: error (UTF-8 diagnostic text)
//!
//! There is no delimiter, so payloads may contain newlines or text equal to
//! a marker. Only the kind byte decides whether a frame is a marker.
//!
//! Every write is flushed immediately so streamed items and cancel requests
//! are not held back by buffering.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use futures_util::stream::{self, Stream};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::Marker;

/// Maximum frame length (kind byte + payload), 16 MB.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the read buffer used by [`FrameReader`].
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Frame kind constants.
pub mod frame_kind {
    /// Text payload: request or result item.
    pub const DATA: u8 = 0x01;
    /// Control marker.
    pub const CONTROL: u8 = 0x02;
    /// Inline diagnostic text.
    pub const ERROR: u8 = 0x03;
}

/// Errors raised by the framed channel.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream before a complete frame arrived.
    ///
    /// This is the normal way a peer says it is finished.
    #[error("end of channel")]
    EndOfChannel,

    /// The stream is no longer writable.
    #[error("channel closed")]
    ChannelClosed,

    /// A frame length exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {length} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge {
        /// Offending length.
        length: u64,
    },

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Other I/O failure.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Self::EndOfChannel,
            _ => Self::Io(err),
        }
    }

    fn from_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => Self::ChannelClosed,
            _ => Self::Io(err),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Request text or one result item.
    Data(String),
    /// Protocol control marker.
    Control(Marker),
    /// Inline diagnostic (script error or server error).
    Error(String),
}

impl Frame {
    /// Frame kind byte.
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Data(_) => frame_kind::DATA,
            Frame::Control(_) => frame_kind::CONTROL,
            Frame::Error(_) => frame_kind::ERROR,
        }
    }

    /// UTF-8 payload bytes.
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Data(text) | Frame::Error(text) => text.as_bytes(),
            Frame::Control(marker) => marker.as_str().as_bytes(),
        }
    }

    /// Encode this frame into a wire-format byte vector.
    ///
    /// Returns `[u32 LE length][u8 kind][payload]`.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_raw(self.kind(), self.payload())
    }

    fn label(&self) -> &'static str {
        match self {
            Frame::Data(_) => "data",
            Frame::Control(_) => "control",
            Frame::Error(_) => "error",
        }
    }
}

/// Encode a raw frame with kind byte and payload.
fn encode_raw(kind: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length = payload.len() as u64 + 1; // +1 for kind byte
    if length > u64::from(MAX_FRAME_SIZE) {
        return Err(FrameError::TooLarge { length });
    }
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&(length as u32).to_le_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn check_length(length: u32) -> Result<(), FrameError> {
    if length == 0 {
        return Err(FrameError::Malformed("zero length".to_string()));
    }
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            length: u64::from(length),
        });
    }
    Ok(())
}

/// Decode a single frame from a kind byte and payload.
fn decode_frame(kind: u8, payload: &[u8]) -> Result<Frame, FrameError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| FrameError::Malformed(format!("payload is not UTF-8: {e}")))?;
    match kind {
        frame_kind::DATA => Ok(Frame::Data(text.to_string())),
        frame_kind::ERROR => Ok(Frame::Error(text.to_string())),
        frame_kind::CONTROL => Marker::parse(text)
            .map(Frame::Control)
            .ok_or_else(|| FrameError::Malformed(format!("unknown control marker: {text:?}"))),
        _ => Err(FrameError::Malformed(format!("unknown frame kind: 0x{kind:02x}"))),
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            check_length(length)?;

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }

            let frame = decode_frame(self.buf[4], &self.buf[5..total])?;
            frames.push(frame);
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

// ============================================================================
// Async channel halves
// ============================================================================

/// Reading half of a framed channel.
///
/// Frames read ahead of the caller are queued, so handing the reader to
/// another task never drops a frame that already arrived.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    pending: VecDeque<Frame>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap the read half of a stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Read the next frame.
    ///
    /// Cancel-safe: dropping the future never loses a decoded frame.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                log::trace!("READ: {} frame ({} bytes)", frame.label(), frame.payload().len());
                return Ok(frame);
            }

            let n = self
                .reader
                .read(&mut self.buf)
                .await
                .map_err(FrameError::from_read)?;
            if n == 0 {
                if self.decoder.has_partial() {
                    log::debug!("Channel closed in the middle of a frame");
                }
                return Err(FrameError::EndOfChannel);
            }
            let frames = self.decoder.feed(&self.buf[..n])?;
            self.pending.extend(frames);
        }
    }

    /// All remaining frames as a lazy stream.
    ///
    /// The stream ends quietly at end-of-channel and yields at most one
    /// error before ending. It borrows the reader, so it can be dropped and
    /// requested again to continue from the current position.
    pub fn frames(&mut self) -> impl Stream<Item = Result<Frame, FrameError>> + '_ {
        stream::unfold(Some(self), |state| async move {
            let Some(reader) = state else {
                return None;
            };
            match reader.read_frame().await {
                Ok(frame) => Some((Ok(frame), Some(reader))),
                Err(FrameError::EndOfChannel) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// Writing half of a framed channel.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap the write half of a stream.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write and flush one frame. Returns the payload byte count.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<usize, FrameError> {
        let encoded = frame.encode()?;
        self.writer
            .write_all(&encoded)
            .await
            .map_err(FrameError::from_write)?;
        self.writer.flush().await.map_err(FrameError::from_write)?;
        log::trace!("WRITE: {} frame ({} bytes)", frame.label(), frame.payload().len());
        Ok(frame.payload().len())
    }

    /// Shut down the write direction, signalling end-of-channel to the peer.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await.map_err(FrameError::from_write)
    }
}

// ============================================================================
// Blocking variants
// ============================================================================

fn read_exact_or_end<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(FrameError::from_read)
}

/// Read one frame from a blocking reader.
pub fn read_frame_blocking<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; 4];
    read_exact_or_end(reader, &mut header)?;
    let length = u32::from_le_bytes(header);
    check_length(length)?;

    let mut body = vec![0u8; length as usize];
    read_exact_or_end(reader, &mut body)?;
    decode_frame(body[0], &body[1..])
}

/// Write and flush one frame to a blocking writer. Returns the payload byte count.
pub fn write_frame_blocking<W: Write>(writer: &mut W, frame: &Frame) -> Result<usize, FrameError> {
    let encoded = frame.encode()?;
    writer.write_all(&encoded).map_err(FrameError::from_write)?;
    writer.flush().map_err(FrameError::from_write)?;
    Ok(frame.payload().len())
}
