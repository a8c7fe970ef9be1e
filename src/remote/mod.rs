//! Length-prefixed JSON transport between the rig and a remote policy.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod server;
