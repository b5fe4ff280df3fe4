//! Wire layer shared by the runner and execution sides.
//!
//! # Architecture
//!
//! - **wire**: Reserved bytes, command vocabulary, segment splitting
//! - **codec**: Terminator-delimited framing for AsyncRead/AsyncWrite
//! - **protocol**: JSON payloads (handshake info, forwarded messages)

pub mod codec;
pub mod protocol;
pub mod wire;
