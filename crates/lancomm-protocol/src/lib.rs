//! Wire formats for the lancomm intercom fabric.
//!
//! Three surfaces share this crate:
//! - the TCP control protocol: newline-delimited ASCII verbs ([`control`]),
//! - the UDP audio datagrams: fixed binary headers + raw PCM ([`frame`]),
//! - the shared-secret challenge handshake ([`auth`]).

pub mod auth;
pub mod control;
pub mod error;
pub mod frame;
pub mod types;
