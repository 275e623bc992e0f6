//! Terminal Control Frame Protocol
//!
//! This crate defines the JSON frames exchanged between a browser terminal
//! and the podterm exec bridge.

pub mod protocol;

pub use protocol::{
    decode, decode_slice, encode, encode_output, ControlFrame, FrameError, Operation,
    END_OF_TRANSMISSION,
};
