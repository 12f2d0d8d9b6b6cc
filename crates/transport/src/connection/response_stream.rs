use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::StreamError;
use crate::ensure;

/// Where response bytes go once the stream accepted them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameControl: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<(), StreamError>;

    fn flush(&self) -> Result<(), StreamError>;

    async fn write_async(&self, data: &[u8], cancel: CancellationToken) -> Result<(), StreamError>;

    async fn flush_async(&self, cancel: CancellationToken) -> Result<(), StreamError>;
}

/// The write-only body stream handed to application code.
///
/// Two one-way switches guard every call: after [`stop_accepting_writes`](Self::stop_accepting_writes)
/// calls fail with [`StreamError::Disposed`], after [`abort`](Self::abort) with
/// [`StreamError::Aborted`]. When both are set the stop wins. Work that already reached the
/// [`FrameControl`] is not affected.
#[derive(Debug)]
pub struct ResponseStream<F> {
    frame: F,
    stopped: AtomicBool,
    aborted: AtomicBool,
}

impl<F: FrameControl> ResponseStream<F> {
    pub fn new(frame: F) -> Self {
        Self { frame, stopped: AtomicBool::new(false), aborted: AtomicBool::new(false) }
    }

    pub fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        self.ensure_writable()?;
        self.frame.write(data)
    }

    pub fn flush(&self) -> Result<(), StreamError> {
        self.ensure_writable()?;
        self.frame.flush()
    }

    pub async fn write_async(&self, data: &[u8], cancel: CancellationToken) -> Result<(), StreamError> {
        self.ensure_writable()?;
        self.frame.write_async(data, cancel).await
    }

    pub async fn flush_async(&self, cancel: CancellationToken) -> Result<(), StreamError> {
        self.ensure_writable()?;
        self.frame.flush_async(cancel).await
    }

    /// Called once the application is done with the response.
    pub fn stop_accepting_writes(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Called when the request is torn down underneath the application.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            debug!("response stream aborted");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn frame(&self) -> &F {
        &self.frame
    }

    fn ensure_writable(&self) -> Result<(), StreamError> {
        ensure!(!self.stopped.load(Ordering::Acquire), StreamError::Disposed);
        ensure!(!self.aborted.load(Ordering::Acquire), StreamError::Aborted);
        Ok(())
    }
}

impl<F: FrameControl> io::Write for ResponseStream<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ResponseStream::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(ResponseStream::flush(self)?)
    }
}
