//! Kubernetes pod exec
//!
//! Runs a command inside a pod through the kube crate's websocket support and
//! pumps its I/O against a [`StreamOptions`] set.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, AttachParams},
    Client,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::terminal::{
    ExecTarget, InputSource, OutputSink, RemoteExecutor, SizeSource, StreamOptions, TerminalError,
};

const IO_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Terminal error: {0}")]
    TerminalError(#[from] TerminalError),

    #[error("Exec stream has no {0} channel")]
    ChannelClosed(&'static str),

    #[error("Remote command error: {0}")]
    RemoteCommandError(String),

    #[error("Exec task panicked: {0}")]
    Panicked(String),
}

/// Default shell: prefer bash, fall back to sh
pub fn default_shell_command() -> Vec<String> {
    ["/bin/sh", "-c", "command -v bash >/dev/null && exec bash || exec sh"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// [`RemoteExecutor`] backed by the pods/exec subresource
#[derive(Clone)]
pub struct KubeExecutor {
    client: Client,
}

impl KubeExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn attach_params(target: &ExecTarget, tty: bool) -> AttachParams {
        // The API server rejects stderr together with a TTY; a TTY merges it into stdout
        let params = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(!tty)
            .tty(tty);
        if target.container.is_empty() {
            params
        } else {
            params.container(target.container.as_str())
        }
    }
}

impl std::fmt::Debug for KubeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteExecutor for KubeExecutor {
    async fn stream(
        &self,
        target: &ExecTarget,
        command: &[String],
        options: StreamOptions,
    ) -> Result<(), ExecError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = Self::attach_params(target, options.tty);

        tracing::debug!(%target, ?command, tty = options.tty, "Starting pod exec");
        let mut attached = pods.exec(&target.pod, command.iter(), &params).await?;

        let stdin = attached.stdin().ok_or(ExecError::ChannelClosed("stdin"))?;
        let stdout = attached.stdout().ok_or(ExecError::ChannelClosed("stdout"))?;
        let stderr = if options.tty { None } else { attached.stderr() };
        let size_tx = attached.terminal_size();
        let status = attached.take_status();

        let output = async {
            match stderr {
                Some(stderr) => {
                    futures::try_join!(
                        pump_output(stdout, &*options.stdout),
                        pump_output(stderr, &*options.stderr),
                    )?;
                }
                None => pump_output(stdout, &*options.stdout).await?,
            }
            Ok::<(), ExecError>(())
        };

        // Input and resize run for as long as the output does
        let background = async {
            tokio::join!(
                pump_input(&*options.stdin, stdin),
                pump_resize(&*options.resize, size_tx),
            );
            std::future::pending::<()>().await;
        };

        tokio::select! {
            result = output => result?,
            () = background => {}
        }

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    let message = status
                        .message
                        .or(status.reason)
                        .unwrap_or_else(|| "command failed".to_string());
                    return Err(ExecError::RemoteCommandError(message));
                }
            }
        }

        attached
            .join()
            .await
            .map_err(|e| ExecError::RemoteCommandError(e.to_string()))?;
        tracing::debug!(%target, "Pod exec finished");
        Ok(())
    }
}

/// Forward client input to the process's stdin until the client side ends
pub(crate) async fn pump_input(source: &dyn InputSource, mut stdin: impl AsyncWrite + Unpin) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => continue,
            Ok(n) => {
                if stdin.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Input source ended");
                // buf[0] holds the end-of-transmission marker
                let _ = stdin.write_all(&buf[..1]).await;
                let _ = stdin.flush().await;
                break;
            }
        }
    }
    let _ = stdin.shutdown().await;
}

/// Forward process output until EOF
pub(crate) async fn pump_output(
    mut reader: impl AsyncRead + Unpin,
    sink: &dyn OutputSink,
) -> Result<(), ExecError> {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write(&buf[..n]).await?;
    }
}

/// Forward terminal sizes until the source is exhausted
pub(crate) async fn pump_resize(
    source: &dyn SizeSource,
    size_tx: Option<mpsc::Sender<kube::api::TerminalSize>>,
) {
    let Some(mut size_tx) = size_tx else {
        return;
    };
    while let Some(size) = source.next().await {
        tracing::trace!(cols = size.cols, rows = size.rows, "Forwarding resize");
        if size_tx.send(size.into()).await.is_err() {
            break;
        }
    }
}
