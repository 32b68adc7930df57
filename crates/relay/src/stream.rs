//! Response body adapter over encoder stdout

use crate::supervisor::ProcessHandle;
use bytes::Bytes;
use futures_core::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::process::ChildStdout;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Encoder stdout as a byte stream.
///
/// Dropping the stream (response finished or client gone) asks the encoder
/// to stop through the supervisor; a process that already exited is left
/// alone.
pub struct ProcessStream {
    inner: ReaderStream<ChildStdout>,
    handle: ProcessHandle,
}

impl ProcessStream {
    pub fn new(stdout: ChildStdout, handle: ProcessHandle) -> Self {
        Self {
            inner: ReaderStream::new(stdout),
            handle,
        }
    }
}

impl Stream for ProcessStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        if self.handle.cleanup(false) {
            debug!(pid = ?self.handle.pid, "Response stream ended, stopping encoder");
        }
    }
}
