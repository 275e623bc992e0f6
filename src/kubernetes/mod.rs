//! Kubernetes integration module
//!
//! Provides client bootstrap and pod exec.

pub mod client;
pub mod exec;

pub use client::{KubeClient, KubeClientError};
pub use exec::{default_shell_command, ExecError, KubeExecutor};
