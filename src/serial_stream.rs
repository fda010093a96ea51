//! Non-blocking buffered byte stream to a BitScope.
//!
//! [`SerialStream`] wraps any Tokio byte device (a serial port, a pipe, an
//! in-memory duplex) and gives it write buffering with backpressure plus
//! readiness-driven reads. A write never blocks: whatever the device does not
//! accept immediately is queued, and [`SerialStream::drain`] waits until the
//! queue is empty. A read with nothing available parks the task on the
//! device's read readiness instead of polling.

use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest chunk returned by an unbounded [`SerialStream::read`].
const READ_CHUNK: usize = 4096;

/// Byte device usable underneath a [`SerialStream`].
pub trait Device: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Device for T {}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Stream is closed")]
    NotConnected,

    #[error("Device closed the connection")]
    ConnectionLost,
}

pub struct SerialStream<T> {
    device: Option<T>,
    name: String,
    output: Vec<u8>,
}

impl<T> fmt::Debug for SerialStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<SerialStream:{}>", self.name)
    }
}

/// Timeouts count as "nothing written yet", everything else is fatal.
fn is_write_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// One non-blocking write attempt.
///
/// `Pending` means the device registered the task's waker for write
/// readiness. A device-side timeout is `Ready(Ok(0))`: nothing was written
/// and no wake-up is registered.
fn poll_write_once<T: Device>(
    device: &mut T,
    cx: &mut Context<'_>,
    data: &[u8],
) -> Poll<io::Result<usize>> {
    match Pin::new(device).poll_write(cx, data) {
        Poll::Ready(Ok(0)) => Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
        Poll::Ready(Err(e)) if is_write_timeout(&e) => Poll::Ready(Ok(0)),
        other => other,
    }
}

impl<T: Device> SerialStream<T> {
    pub fn new(device: T, name: impl Into<String>) -> Self {
        let name = name.into();
        tracing::debug!(stream = %name, "Opened SerialStream");
        Self {
            device: Some(device),
            name,
            output: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Number of bytes queued but not yet accepted by the device.
    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Queue `data` for the device.
    ///
    /// If nothing is queued yet, one non-blocking write is attempted right
    /// away; the unwritten remainder (or all of `data`, when earlier bytes
    /// are still waiting) is appended to the output buffer in order.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        let device = self.device.as_mut().ok_or(StreamError::NotConnected)?;
        if data.is_empty() {
            return Ok(());
        }
        if !self.output.is_empty() {
            self.output.extend_from_slice(data);
            return Ok(());
        }

        let written = poll_fn(|cx| match poll_write_once(device, cx, data) {
            Poll::Pending => Poll::Ready(Ok(0)),
            ready => ready,
        })
        .await;

        let n = match written {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(stream = %self.name, error = %e, "Error writing to stream");
                return Err(e.into());
            }
        };
        if n > 0 {
            tracing::trace!(stream = %self.name, bytes = n, data = ?&data[..n], "Write");
        }
        self.output.extend_from_slice(&data[n..]);
        if !self.output.is_empty() {
            tracing::trace!(stream = %self.name, pending = self.output.len(), "Output buffered");
        }
        Ok(())
    }

    /// Wait until every queued byte has been accepted by the device.
    ///
    /// The returned future borrows the stream exclusively, so there is never
    /// more than one drain in flight.
    pub fn drain(&mut self) -> Drain<'_, T> {
        Drain { stream: self }
    }

    /// Push queued output into the device until it stops accepting bytes.
    ///
    /// After a device-side timeout the task is only re-woken when
    /// `retry_timeouts` is set; a parked read waits on read readiness
    /// instead.
    fn poll_feed(
        &mut self,
        cx: &mut Context<'_>,
        retry_timeouts: bool,
    ) -> Poll<Result<(), StreamError>> {
        while !self.output.is_empty() {
            let Some(device) = self.device.as_mut() else {
                return Poll::Ready(Err(StreamError::NotConnected));
            };
            match poll_write_once(device, cx, &self.output) {
                Poll::Ready(Ok(0)) => {
                    if retry_timeouts {
                        cx.waker().wake_by_ref();
                    }
                    return Poll::Pending;
                }
                Poll::Ready(Ok(n)) => {
                    tracing::trace!(stream = %self.name, bytes = n, data = ?&self.output[..n], "Write");
                    self.output.drain(..n);
                }
                Poll::Ready(Err(e)) => {
                    tracing::error!(stream = %self.name, error = %e, "Error writing to stream");
                    self.output.clear();
                    return Poll::Ready(Err(e.into()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_read_some(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<usize, StreamError>> {
        // Queued output keeps flowing while we wait for the reply to it.
        if let Poll::Ready(Err(e)) = self.poll_feed(cx, false) {
            return Poll::Ready(Err(e));
        }
        let Some(device) = self.device.as_mut() else {
            return Poll::Ready(Err(StreamError::NotConnected));
        };

        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(device).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let data = read_buf.filled();
                if data.is_empty() {
                    tracing::error!(stream = %self.name, "Device closed the connection");
                    return Poll::Ready(Err(StreamError::ConnectionLost));
                }
                tracing::trace!(stream = %self.name, bytes = data.len(), data = ?data, "Read");
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(e)) => {
                tracing::error!(stream = %self.name, error = %e, "Error reading from stream");
                Poll::Ready(Err(e.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Return the bytes the device has available, at most `max`.
    ///
    /// When nothing is available the task is suspended until the device
    /// signals read readiness; at least one byte is always returned.
    pub async fn read(&mut self, max: Option<usize>) -> Result<Vec<u8>, StreamError> {
        let limit = max.unwrap_or(READ_CHUNK);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; limit];
        let n = poll_fn(|cx| self.poll_read_some(cx, &mut buf)).await?;
        buf.truncate(n);
        Ok(buf)
    }

    pub async fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        let mut data = Vec::with_capacity(n);
        while data.len() < n {
            let chunk = self.read(Some(n - data.len())).await?;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Release the device. Calling this more than once is harmless.
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            if !self.output.is_empty() {
                tracing::warn!(stream = %self.name, dropped = self.output.len(), "Closing with unsent output");
            }
            self.output.clear();
            tracing::debug!(stream = %self.name, "Closed SerialStream");
        }
    }
}

/// Completion of a [`SerialStream::drain`].
pub struct Drain<'a, T> {
    stream: &'a mut SerialStream<T>,
}

impl<T: Device> Future for Drain<'_, T> {
    type Output = Result<(), StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().stream.poll_feed(cx, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Counts how often the stream polls the device for input.
    struct CountingDevice {
        inner: DuplexStream,
        read_polls: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingDevice {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.read_polls.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingDevice {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Reads from the pipe, times out every write and counts the attempts.
    struct StalledWriter {
        inner: DuplexStream,
        write_polls: Arc<AtomicUsize>,
    }

    impl AsyncRead for StalledWriter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StalledWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.write_polls.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Err(io::ErrorKind::TimedOut.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Fails the first `timeouts` writes with a timeout, then fails with
    /// `error` if one is set, otherwise accepts everything.
    struct ScriptedWriter {
        timeouts: usize,
        error: Option<io::ErrorKind>,
    }

    impl AsyncRead for ScriptedWriter {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for ScriptedWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.timeouts > 0 {
                self.timeouts -= 1;
                return Poll::Ready(Err(io::ErrorKind::TimedOut.into()));
            }
            if let Some(kind) = self.error {
                return Poll::Ready(Err(kind.into()));
            }
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_slow_device() {
        // The pipe holds at most 3 bytes, so every write attempt moves <= 3.
        let (host, mut device) = tokio::io::duplex(3);
        let mut stream = SerialStream::new(host, "duplex");
        let payload: Vec<u8> = (0u8..64).collect();

        stream.write(&payload[..40]).await.unwrap();
        stream.write(&payload[40..]).await.unwrap();
        assert!(stream.pending_output() >= 61);

        let reader = tokio::spawn(async move {
            let mut received = vec![0u8; 64];
            device.read_exact(&mut received).await.unwrap();
            received
        });

        stream.drain().await.unwrap();
        assert_eq!(stream.pending_output(), 0);
        assert_eq!(reader.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_drain_is_noop_when_empty() {
        let (host, _device) = tokio::io::duplex(16);
        let mut stream = SerialStream::new(host, "duplex");
        stream.write(b"abc").await.unwrap();
        assert_eq!(stream.pending_output(), 0);
        stream.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_suspends_until_ready() {
        let (host, mut device) = tokio::io::duplex(64);
        let read_polls = Arc::new(AtomicUsize::new(0));
        let mut stream = SerialStream::new(
            CountingDevice {
                inner: host,
                read_polls: Arc::clone(&read_polls),
            },
            "counting",
        );

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            device.write_all(b"hello").await.unwrap();
            device
        });

        let data = stream.read(None).await.unwrap();
        assert_eq!(data, b"hello");
        // One poll that parked the task, one after the wake-up.
        assert_eq!(read_polls.load(Ordering::SeqCst), 2);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_respects_max() {
        let (host, mut device) = tokio::io::duplex(64);
        let mut stream = SerialStream::new(host, "duplex");
        device.write_all(b"abcdef").await.unwrap();

        assert_eq!(stream.read(Some(4)).await.unwrap(), b"abcd");
        assert_eq!(stream.read(None).await.unwrap(), b"ef");
    }

    #[tokio::test]
    async fn test_read_exactly_accumulates_chunks() {
        let (host, mut device) = tokio::io::duplex(64);
        let mut stream = SerialStream::new(host, "duplex");

        let writer = tokio::spawn(async move {
            for chunk in [&b"01"[..], b"234", b"56789"] {
                device.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            device
        });

        assert_eq!(stream.read_exactly(10).await.unwrap(), b"0123456789");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_write_timeout_is_not_fatal() {
        let mut stream = SerialStream::new(
            ScriptedWriter {
                timeouts: 3,
                error: None,
            },
            "scripted",
        );
        stream.write(b"reset").await.unwrap();
        assert_eq!(stream.pending_output(), 5);
        stream.drain().await.unwrap();
        assert_eq!(stream.pending_output(), 0);
    }

    #[tokio::test]
    async fn test_read_does_not_spin_on_write_timeouts() {
        let (host, mut device) = tokio::io::duplex(64);
        let write_polls = Arc::new(AtomicUsize::new(0));
        let mut stream = SerialStream::new(
            StalledWriter {
                inner: host,
                write_polls: Arc::clone(&write_polls),
            },
            "stalled",
        );
        stream.write(b"cmd").await.unwrap();
        assert_eq!(stream.pending_output(), 3);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            device.write_all(b"ok").await.unwrap();
            device
        });

        assert_eq!(stream.read(None).await.unwrap(), b"ok");
        // The first write, one feed before parking, one after the wake-up.
        assert_eq!(write_polls.load(Ordering::SeqCst), 3);
        assert_eq!(stream.pending_output(), 3);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_write_error_is_fatal() {
        let mut stream = SerialStream::new(
            ScriptedWriter {
                timeouts: 1,
                error: Some(io::ErrorKind::BrokenPipe),
            },
            "scripted",
        );
        stream.write(b"abc").await.unwrap();
        let result = stream.drain().await;
        assert!(matches!(result, Err(StreamError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe));
        assert_eq!(stream.pending_output(), 0);
    }

    #[tokio::test]
    async fn test_device_eof_is_connection_lost() {
        let (host, device) = tokio::io::duplex(16);
        let mut stream = SerialStream::new(host, "duplex");
        drop(device);
        assert!(matches!(
            stream.read(None).await,
            Err(StreamError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (host, _device) = tokio::io::duplex(16);
        let mut stream = SerialStream::new(host, "duplex");
        stream.close();
        stream.close();
        assert!(!stream.is_open());
        assert!(matches!(
            stream.write(b"x").await,
            Err(StreamError::NotConnected)
        ));
        assert!(matches!(
            stream.read(None).await,
            Err(StreamError::NotConnected)
        ));
    }
}
