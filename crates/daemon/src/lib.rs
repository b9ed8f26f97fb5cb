//! Cyreal core library
//!
//! A cybernetic serial-port gateway: serial port controllers under a
//! five-level governor hierarchy, multiplexed to RFC-1918 peers over a
//! JSON-RPC 2.0 bridge, with self-repair and an append-only audit stream.

pub mod a2a;
pub mod audit;
pub mod config;
pub mod error;
pub mod governor;
pub mod manager;
pub mod meta;
pub mod platform;
pub mod runtime;
pub mod serial;
