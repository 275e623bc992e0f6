//! Remote process I/O seam
//!
//! The exec stream consumes three capabilities: somewhere to read user input
//! from, somewhere to write process output to, and a source of terminal size
//! changes. [`TerminalSession`](super::TerminalSession) provides all three;
//! tests provide scripted ones.

use std::sync::Arc;

use async_trait::async_trait;

use super::resize::TerminalSize;
use super::session::TerminalError;
use crate::kubernetes::ExecError;

/// Byte source feeding the remote process's stdin
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Read the next chunk of input into `buf`.
    ///
    /// `Ok(0)` means the inbound message carried no input (a resize or a
    /// keepalive); it is not end of stream. On `Err` the sentinel
    /// [`END_OF_TRANSMISSION`](podterm_protocol::END_OF_TRANSMISSION) has been
    /// written to `buf[0]` and no more input will follow.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TerminalError>;
}

/// Byte sink receiving remote process output
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write(&self, buf: &[u8]) -> Result<usize, TerminalError>;
}

/// Source of terminal size changes
#[async_trait]
pub trait SizeSource: Send + Sync {
    /// Next size, or `None` when no further sizes will come.
    async fn next(&self) -> Option<TerminalSize>;
}

/// Where to attach inside the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    /// Empty selects the pod's default container
    pub container: String,
}

impl ExecTarget {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl std::fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)?;
        if !self.container.is_empty() {
            write!(f, ":{}", self.container)?;
        }
        Ok(())
    }
}

/// I/O handed to a [`RemoteExecutor`] for one stream
#[derive(Clone)]
pub struct StreamOptions {
    pub stdin: Arc<dyn InputSource>,
    pub stdout: Arc<dyn OutputSink>,
    pub stderr: Arc<dyn OutputSink>,
    pub resize: Arc<dyn SizeSource>,
    pub tty: bool,
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions").field("tty", &self.tty).finish_non_exhaustive()
    }
}

/// Opens a process inside the cluster and runs its I/O to completion
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Returns `Ok(())` when the process exits normally.
    async fn stream(
        &self,
        target: &ExecTarget,
        command: &[String],
        options: StreamOptions,
    ) -> Result<(), ExecError>;
}
