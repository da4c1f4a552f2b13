//! A local DNS resolver that races every upstream and relays the fastest reply.
//!
//! The library half exists so the codec can be benchmarked; the binary in
//! `main.rs` wires everything to real sockets.

pub mod config;
pub mod protocol;
pub mod redirect;
pub mod resolver;
pub mod server;
pub mod stats;

#[cfg(test)]
mod testing;
