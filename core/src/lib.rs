//! # Driftq Core Library
//!
//! Driftq is a distributed message queue. This crate provides the pieces shared
//! by brokers and clients:
//!
//! - [`protocol`] - the TCP wire protocol: frames, commands, and message codecs
//! - [`storage`] - [`DiskQueue`], a durable filesystem-backed FIFO with bounded
//!   memory footprint
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use driftq::DiskQueue;
//!
//! #[tokio::main]
//! async fn main() -> driftq::Result<()> {
//!     let mut queue = DiskQueue::new("orders", "./data", 100 * 1024 * 1024, 2500)?;
//!
//!     queue.put(Bytes::from_static(b"hello")).await?;
//!     if let Some(body) = queue.recv().await {
//!         println!("got {} bytes", body.len());
//!     }
//!
//!     queue.close().await?;
//!     Ok(())
//! }
//! ```

pub mod protocol;
pub mod storage;

pub use protocol::{Command, Frame, FrameType, Message, MessageId};
pub use storage::DiskQueue;

use thiserror::Error;

/// Driftq error types
///
/// # Error Categories
///
/// - **Storage**: file I/O, fsync, and metadata persistence failures
/// - **Protocol**: malformed frames, unknown frame types, invalid commands
/// - **Config**: invalid names or out-of-range options
/// - **Exiting**: an operation was attempted on a closed component
#[derive(Debug, Error)]
pub enum DriftqError {
    /// Storage subsystem errors including file I/O and persistence failures
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Wire protocol framing and parsing errors
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration validation errors
    #[error("configuration error: {0}")]
    Config(String),

    /// The component has been closed and no longer accepts operations
    #[error("exiting")]
    Exiting,
}

/// Result type alias for driftq operations
pub type Result<T> = std::result::Result<T, DriftqError>;
