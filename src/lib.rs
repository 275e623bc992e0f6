pub mod config;
pub mod kubernetes;
pub mod server;
pub mod terminal;

pub use config::AppConfig;
pub use server::{serve, Server, ServerError};
pub use terminal::{Bridge, BridgeOutcome, ExecTarget, RemoteExecutor, TerminalSession};
