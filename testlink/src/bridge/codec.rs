//! Framed codec for runner/execution communication.
//!
//! Uses AnyDelimiterCodec to find terminator-delimited chunks, then splits
//! the command token off the front. Works over any AsyncRead/AsyncWrite.

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::wire::{self, Command, SEPARATOR, TERMINATOR};

/// Largest chunk accepted before the decoder gives up on the stream.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

// AnyDelimiterCodec seeks single bytes.
const _: () = assert!(TERMINATOR.len() == 1);

/// Outbound frame: a known command plus zero or more segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub segments: Vec<Bytes>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            segments: Vec::new(),
        }
    }

    pub fn with_segment(mut self, segment: impl Into<Bytes>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn encoded_len(&self) -> usize {
        self.command.as_bytes().len()
            + self
                .segments
                .iter()
                .map(|s| SEPARATOR.len() + s.len())
                .sum::<usize>()
            + TERMINATOR.len()
    }
}

/// Inbound frame as read off the wire.
///
/// The token is kept raw so unknown commands can be reported verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub token: Bytes,
    /// Everything after the first separator. Empty payloads are `None`.
    pub payload: Option<Bytes>,
}

impl RawFrame {
    pub fn parse(chunk: Bytes) -> Self {
        let (token, payload) = wire::split_on_separator(&chunk);
        let token_len = token.len();
        let payload_len = payload.map(<[u8]>::len);

        let payload = match payload_len {
            Some(0) | None => None,
            Some(len) => Some(chunk.slice(chunk.len() - len..)),
        };

        Self {
            token: chunk.slice(..token_len),
            payload,
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_token(&self.token)
    }

    pub fn token_lossy(&self) -> String {
        String::from_utf8_lossy(&self.token).into_owned()
    }
}

/// Codec that splits the stream on the terminator and parses each chunk.
pub struct FrameCodec {
    inner: AnyDelimiterCodec,
    dropped_tail: Option<usize>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                TERMINATOR.to_vec(),
                TERMINATOR.to_vec(),
                max_length,
            ),
            dropped_tail: None,
        }
    }

    /// Length of the unterminated chunk discarded at end of stream, if any.
    ///
    /// The decoder has no diagnostics sink of its own; the reader collects
    /// this after the stream ends.
    pub fn take_dropped_tail(&mut self) -> Option<usize> {
        self.dropped_tail.take()
    }
}

fn into_io(e: AnyDelimiterCodecError) -> io::Error {
    match e {
        AnyDelimiterCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src).map_err(into_io)? {
                // Blank lines carry no command.
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => return Ok(Some(RawFrame::parse(chunk))),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    tracing::debug!(
                        trailing_bytes = src.len(),
                        "Dropping unterminated frame at end of stream"
                    );
                    self.dropped_tail = Some(src.len());
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.encoded_len();
        tracing::trace!(command = %item.command, frame_size_bytes = len, "Encoding frame");

        dst.reserve(len);
        dst.put_slice(item.command.as_bytes());
        for segment in &item.segments {
            dst.put_slice(SEPARATOR);
            dst.put_slice(segment);
        }
        dst.put_slice(TERMINATOR);
        Ok(())
    }
}
