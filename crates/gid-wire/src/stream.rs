//! Async frame reader and writer over tokio byte streams.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::frame::{Frame, WireError};
use crate::framing::LengthCodec;

const READ_CHUNK: usize = 8 * 1024;

pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    codec: LengthCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: LengthCodec) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames. A body that fails to
    /// parse yields [`WireError::Malformed`]; its length prefix has already
    /// been consumed, so the caller may keep reading.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, WireError> {
        loop {
            if let Some(body) = self.codec.decode_stream(&mut self.buf)? {
                trace!(len = body.len(), "frame received");
                return Frame::decode(&body).map(Some);
            }

            if self.buf.capacity() - self.buf.len() < READ_CHUNK {
                self.buf.reserve(READ_CHUNK);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )));
            }
        }
    }
}

pub struct FrameWriter<W> {
    inner: W,
    codec: LengthCodec,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, codec: LengthCodec) -> Self {
        Self { inner, codec }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), WireError> {
        let body = frame.encode()?;
        let framed = self.codec.encode(&body)?;
        self.inner.write_all(&framed).await?;
        self.inner.flush().await?;
        trace!(tag = %frame.tag(), len = body.len(), "frame sent");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_writer_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client, LengthCodec::default());
        let mut reader = FrameReader::new(server, LengthCodec::default());

        let frames = vec![
            Frame::ListAgents,
            Frame::GetKey("AGENT-B".into()),
            Frame::Msg {
                recipients: vec!["AGENT-B".into()],
                blob: "00".repeat(80) + "||" + &"Q".repeat(200),
            },
        ];

        let expected = frames.clone();
        let send = tokio::spawn(async move {
            for f in &frames {
                writer.write_frame(f).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        for f in expected {
            assert_eq!(reader.read_frame().await.unwrap(), Some(f));
        }
        assert_eq!(reader.read_frame().await.unwrap(), None);
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_body_keeps_stream_in_sync() {
        let codec = LengthCodec::default();
        let mut wire = codec.encode(b"garbage").unwrap();
        wire.extend(codec.encode(b"[LIST_AGENTS]").unwrap());

        let mut reader = FrameReader::new(&wire[..], codec);
        assert!(matches!(reader.read_frame().await, Err(WireError::Malformed(_))));
        assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::ListAgents));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let codec = LengthCodec::default();
        let wire = codec.encode(b"[LIST_AGENTS]").unwrap();
        let mut reader = FrameReader::new(&wire[..7], codec);
        assert!(matches!(reader.read_frame().await, Err(WireError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let wire = LengthCodec::new(1024).encode(&[b'x'; 100]).unwrap();
        let mut reader = FrameReader::new(&wire[..], LengthCodec::new(16));
        let err = reader.read_frame().await.unwrap_err();
        assert!(!err.is_recoverable());
    }
}
