//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::SerialConfig;
use crate::error::Result;

/// Receive half of an open transport
#[async_trait]
pub trait SerialReader: Send {
    /// Read whatever arrives within `timeout`
    ///
    /// Returns `Ok(0)` when the timeout elapses with no data. End of stream
    /// and device failures are errors.
    async fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Transmit half of an open transport
#[async_trait]
pub trait SerialWriter: Send {
    /// Write one complete frame and flush it
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Release the transport
    async fn close(&mut self) -> io::Result<()>;
}

/// Both halves of an open transport
pub type TransportHalves = (Box<dyn SerialReader>, Box<dyn SerialWriter>);

/// Acquires a transport for a link session
#[async_trait]
pub trait TransportOpener: Send + Sync {
    /// Open the device described by `config`
    async fn open(&self, config: &SerialConfig) -> Result<TransportHalves>;
}

/// [`SerialReader`] over any tokio `AsyncRead`
pub struct AsyncPortReader<R> {
    inner: R,
}

impl<R> AsyncPortReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> SerialReader for AsyncPortReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        match tokio::time::timeout(timeout, self.inner.read(buf)).await {
            Err(_elapsed) => Ok(0),
            Ok(Ok(0)) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "transport closed",
            )),
            Ok(result) => result,
        }
    }
}

/// [`SerialWriter`] over any tokio `AsyncWrite`
pub struct AsyncPortWriter<W> {
    inner: W,
}

impl<W> AsyncPortWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> SerialWriter for AsyncPortWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
