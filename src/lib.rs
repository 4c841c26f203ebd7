//! rtc-session - peer session negotiation and state synchronisation
//!
//! This crate sits between application code and an external media engine. It
//! issues asynchronous negotiation commands, demultiplexes the engine's shared
//! notification channel by session, keeps an observable mirror of each
//! session's state, and fans changes out to subscribers.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod router;
pub mod session;
pub mod signaling;

pub use error::{Result, RtcError};
