//! Bridge driver
//!
//! Ties one [`TerminalSession`] to one remote process. The exec stream runs on
//! its own task and is raced against the session's done signal, so a client
//! that goes away tears the stream down instead of leaving it parked on a
//! remote read.

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, Stream};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::io::{ExecTarget, RemoteExecutor, StreamOptions};
use super::session::TerminalSession;
use crate::kubernetes::ExecError;

/// How a bridged session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The remote process exited normally
    Completed,
    /// The exec stream failed; the message was relayed to the client
    RemoteFailed(String),
    /// The client side ended first
    ClientGone,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs exec streams for terminal sessions
pub struct Bridge {
    executor: Arc<dyn RemoteExecutor>,
    command: Vec<String>,
}

impl Bridge {
    pub fn new(executor: Arc<dyn RemoteExecutor>, command: Vec<String>) -> Self {
        Self { executor, command }
    }

    /// Stream `target` through `session` until either side ends, then tear the
    /// session down.
    pub async fn run<Tx, Rx, E>(
        &self,
        session: Arc<TerminalSession<Tx, Rx>>,
        target: ExecTarget,
    ) -> BridgeOutcome
    where
        Tx: Sink<Message> + Unpin + Send + 'static,
        Tx::Error: fmt::Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let span = tracing::info_span!("terminal", session = %session.id(), %target);
        self.drive(session, target).instrument(span).await
    }

    async fn drive<Tx, Rx, E>(
        &self,
        session: Arc<TerminalSession<Tx, Rx>>,
        target: ExecTarget,
    ) -> BridgeOutcome
    where
        Tx: Sink<Message> + Unpin + Send + 'static,
        Tx::Error: fmt::Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        tracing::info!(
            namespace = %target.namespace,
            pod = %target.pod,
            container = %target.container,
            "Exec into pod"
        );

        let options = StreamOptions {
            stdin: session.clone(),
            stdout: session.clone(),
            stderr: session.clone(),
            resize: session.clone(),
            tty: true,
        };
        let executor = self.executor.clone();
        let command = self.command.clone();
        let stream_target = target.clone();
        let mut stream = AbortOnDrop(tokio::spawn(
            async move { executor.stream(&stream_target, &command, options).await }
                .in_current_span(),
        ));

        let outcome = tokio::select! {
            biased;
            joined = &mut stream.0 => match joined {
                Ok(Ok(())) => BridgeOutcome::Completed,
                Ok(Err(e)) => BridgeOutcome::RemoteFailed(e.to_string()),
                Err(e) if e.is_panic() => {
                    let panicked = ExecError::Panicked(panic_message(e.into_panic()));
                    BridgeOutcome::RemoteFailed(panicked.to_string())
                }
                Err(e) => BridgeOutcome::RemoteFailed(e.to_string()),
            },
            () = session.closed() => BridgeOutcome::ClientGone,
        };
        drop(stream);

        match &outcome {
            BridgeOutcome::Completed => tracing::info!("Remote process exited"),
            BridgeOutcome::ClientGone => {
                tracing::info!("Client disconnected, exec stream cancelled")
            }
            BridgeOutcome::RemoteFailed(message) => {
                let report = format!("Exec to pod error! err : {message}");
                tracing::error!("{}", report);
                if let Err(e) = session.write(report.as_bytes()).await {
                    tracing::warn!(error = %e, "Failed to deliver exec error to client");
                }
            }
        }

        session.done();
        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "Close after bridge ended");
        }
        outcome
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge").field("command", &self.command).finish_non_exhaustive()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
