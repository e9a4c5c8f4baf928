//! # pullse-shared
//!
//! Domain model, wire protocol frames, and content crypto shared by every
//! crate of the Pullse realtime chat core.  This crate has no dependency on
//! the other workspace members and no I/O of its own.

pub mod constants;
pub mod crypto;
pub mod model;
pub mod protocol;
pub mod types;

mod error;

pub use error::CryptoError;
