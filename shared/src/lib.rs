//! Peertun Shared Library
//!
//! Signaling message types, the tunnel wire framing, and the error
//! taxonomy used by both the gateway and the host side.

pub mod error;
pub mod frame;
pub mod protocol;

pub use error::{Result, TunnelError};
