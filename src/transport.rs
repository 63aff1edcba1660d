//! Length-framed typed byte-stream transport.
//!
//! Every frame on the wire is a 1-byte type tag (`b'o'` for an object frame, `b'f'` for a raw
//! file frame), an 8-byte big-endian unsigned length, and the payload. This module only knows
//! about bytes; interpreting object-frame payloads as [`crate::codec::ControlMessage`]s happens
//! one layer up.
//!
//! An internal growable buffer lets a frame be assembled across an arbitrary number of partial
//! reads.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EstuaryError, Result};

pub const HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Object,
    File,
}

impl FrameType {
    fn tag(self) -> u8 {
        match self {
            FrameType::Object => b'o',
            FrameType::File => b'f',
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            b'o' => Ok(FrameType::Object),
            b'f' => Ok(FrameType::File),
            other => Err(EstuaryError::Frame(format!("unknown frame type tag {other:#x}"))),
        }
    }
}

#[derive(Debug)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

/// Reads length-framed messages off an [`AsyncRead`], buffering partial reads until a full frame
/// is available.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Reads the next complete frame, or `Ok(None)` on a clean EOF with nothing buffered.
    ///
    /// A connection closed mid-frame is reported as an error rather than silently dropping the
    /// partial frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.try_parse_frame()? {
                return Ok(Some(frame));
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(EstuaryError::Frame(
                    "connection closed with a partial frame buffered".to_string(),
                ));
            }
        }
    }

    fn try_parse_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let tag = self.buf[0];
        let len = u64::from_be_bytes(self.buf[1..HEADER_SIZE].try_into().unwrap()) as usize;
        if self.buf.len() < HEADER_SIZE + len {
            return Ok(None);
        }
        let frame_type = FrameType::from_tag(tag)?;
        let mut full = self.buf.split_to(HEADER_SIZE + len);
        full.advance(HEADER_SIZE);
        Ok(Some(Frame {
            frame_type,
            payload: full.freeze(),
        }))
    }
}

/// Writes a single length-framed message.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = frame_type.tag();
    header[1..].copy_from_slice(&(payload.len() as u64).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_single_object_frame() {
        let mut wire = Vec::new();
        write_frame(&mut wire, FrameType::Object, b"hello").await.unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire));
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Object);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assembles_a_frame_split_across_many_reads() {
        let mut wire = Vec::new();
        write_frame(&mut wire, FrameType::File, b"module-bytes").await.unwrap();

        // Feed the reader one byte at a time to force reassembly across many partial reads.
        struct OneByteAtATime(Cursor<Vec<u8>>);
        impl AsyncRead for OneByteAtATime {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let mut tiny = [0u8; 1];
                let mut tiny_buf = tokio::io::ReadBuf::new(&mut tiny);
                match std::pin::Pin::new(&mut self.0).poll_read(cx, &mut tiny_buf) {
                    std::task::Poll::Ready(Ok(())) => {
                        let filled = tiny_buf.filled();
                        if !filled.is_empty() {
                            buf.put_slice(filled);
                        }
                        std::task::Poll::Ready(Ok(()))
                    }
                    other => other,
                }
            }
        }

        let mut reader = FrameReader::new(OneByteAtATime(Cursor::new(wire)));
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::File);
        assert_eq!(&frame.payload[..], b"module-bytes");
    }

    #[tokio::test]
    async fn reads_multiple_frames_delivered_in_one_chunk() {
        let mut wire = Vec::new();
        write_frame(&mut wire, FrameType::Object, b"first").await.unwrap();
        write_frame(&mut wire, FrameType::Object, b"second").await.unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire));
        let a = reader.read_frame().await.unwrap().unwrap();
        let b = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(&a.payload[..], b"first");
        assert_eq!(&b.payload[..], b"second");
    }

    #[tokio::test]
    async fn rejects_an_unknown_type_tag() {
        let mut wire = vec![b'x'];
        wire.extend_from_slice(&0u64.to_be_bytes());
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(reader.read_frame().await.is_err());
    }
}
