//! Byte-sink abstraction the download pipeline writes into.
//!
//! A transport accepts ordered writes, supports an explicit flush, and can
//! report that the peer went away. [`ChannelTransport`] backs streaming HTTP
//! bodies; [`WriterTransport`] wraps any `AsyncWrite`.

use std::future::Future;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::StreamError;

/// Ordered byte sink with explicit flush and disconnect detection.
pub trait Transport: Send {
    /// Writes `data` after everything written before it.
    fn write(&mut self, data: Bytes) -> impl Future<Output = Result<(), StreamError>> + Send;

    /// Pushes buffered bytes towards the peer.
    fn flush(&mut self) -> impl Future<Output = Result<(), StreamError>> + Send;

    /// True once the peer is known to be gone.
    fn is_closed(&self) -> bool;
}

/// Transport feeding a bounded channel, drained by a response body.
///
/// Each write is delivered as its own body frame, so the channel depth bounds
/// how far generation can run ahead of the client.
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelTransport {
    /// Creates a transport and the receiver its bytes arrive on.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    async fn write(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.tx
            .send(data)
            .await
            .map_err(|_| StreamError::Disconnected)
    }

    async fn flush(&mut self) -> Result<(), StreamError> {
        // Frames leave the channel as soon as the body polls them.
        if self.tx.is_closed() {
            return Err(StreamError::Disconnected);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Transport over a raw async writer (socket, pipe, file).
pub struct WriterTransport<W> {
    writer: W,
}

impl<W> WriterTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W> Transport for WriterTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.writer.write_all(&data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StreamError> {
        self.writer.flush().await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Wraps a transport and counts the bytes it accepted.
pub struct Metered<T> {
    inner: T,
    written: u64,
}

impl<T: Transport> Metered<T> {
    pub fn new(inner: T) -> Self {
        Self { inner, written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl<T: Transport> Transport for Metered<T> {
    async fn write(&mut self, data: Bytes) -> Result<(), StreamError> {
        let len = data.len() as u64;
        self.inner.write(data).await?;
        self.written += len;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StreamError> {
        self.inner.flush().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
