pub mod bridge;
pub mod io;
pub mod resize;
pub mod session;

pub use bridge::{Bridge, BridgeOutcome};
pub use io::{ExecTarget, InputSource, OutputSink, RemoteExecutor, SizeSource, StreamOptions};
pub use resize::{DoneSignal, ResizeQueue, TerminalSize};
pub use session::{SessionState, TerminalError, TerminalSession, WsTerminalSession};
