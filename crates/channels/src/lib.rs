//! `channels` crate: the `ChannelAdapter` trait and built-in channel adapters.
//!
//! The engine hands every rendered email/SMS payload to a [`ChannelAdapter`].
//! Real transports live outside this workspace; only the dispatch contract,
//! a tracing-backed adapter and a test double are provided here.

pub mod error;
pub mod traits;
pub mod log;
pub mod mock;

pub use error::DispatchError;
pub use traits::{Channel, ChannelAdapter, DispatchKey, DispatchReceipt, DispatchRequest};
