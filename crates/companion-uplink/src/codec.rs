use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transport::{FrameSink, FrameSource, LinkError};

/// Upper bound on a single JSON body.
pub const MAX_FRAME_LEN: usize = 1 << 20;

// framing: u32 big-endian length + body
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<(), LinkError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(LinkError::Frame(format!("outgoing frame too large: {} bytes", body.len())));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    w.write_all(&buf).await.map_err(LinkError::from_io)?;
    w.flush().await.map_err(LinkError::from_io)?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, LinkError> {
    let len = r.read_u32().await.map_err(LinkError::from_io)? as usize;
    if len > MAX_FRAME_LEN {
        return Err(LinkError::Frame(format!("incoming frame too large: {} bytes", len)));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await.map_err(LinkError::from_io)?;
    Ok(body)
}

/// Frame sink over any byte stream write half.
pub struct StreamSink<W> {
    inner: W,
}

impl<W> StreamSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for StreamSink<W> {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        write_frame(&mut self.inner, frame).await
    }
}

pub struct StreamSource<R> {
    inner: R,
}

impl<R> StreamSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for StreamSource<R> {
    async fn recv(&mut self) -> Result<Vec<u8>, LinkError> {
        read_frame(&mut self.inner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_over_a_byte_stream() {
        let (a, b) = tokio::io::duplex(4096);
        let mut sink = StreamSink::new(a);
        let mut source = StreamSource::new(b);

        sink.send(br#"{"type":"return"}"#).await.unwrap();
        sink.send(b"").await.unwrap();
        assert_eq!(source.recv().await.unwrap(), br#"{"type":"return"}"#.to_vec());
        assert_eq!(source.recv().await.unwrap(), Vec::<u8>::new());

        drop(sink);
        assert!(matches!(source.recv().await, Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes()).await.unwrap();
        let mut source = StreamSource::new(b);
        assert!(matches!(source.recv().await, Err(LinkError::Frame(_))));
    }

    #[tokio::test]
    async fn wire_layout_is_length_prefixed() {
        let mut out = Vec::new();
        write_frame(&mut out, b"abc").await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }
}
