//! # Driftq Client Library
//!
//! An async consumer client for the driftq message broker.
//!
//! ## Features
//!
//! - **Credit-based flow control**: per-connection RDY budgets carved out of
//!   a global max-in-flight ceiling
//! - **Concurrent handlers**: one worker per registration, fed from a shared
//!   incoming queue
//! - **Broker discovery**: periodic lookup-directory polling with automatic
//!   reconnection
//! - **Graceful shutdown**: CLS handshake, in-flight drain, and a hard
//!   thirty-second stop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use driftq::protocol::Message;
//! use driftq_client::{Handler, HandlerError, Reader};
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl Handler for PrintHandler {
//!     async fn handle_message(&self, message: &Message) -> Result<(), HandlerError> {
//!         println!("{}: {:?}", message.id, message.body);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> driftq_client::Result<()> {
//!     let reader = Reader::new("orders", "archive")?;
//!     reader.set_max_in_flight(200);
//!     reader.add_handler(PrintHandler);
//!     reader.connect_to_broker("127.0.0.1:4150").await?;
//!     reader.wait().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod lookup;
pub mod reader;

pub use config::{ReaderConfig, ReaderConfigBuilder};
pub use connection::Connection;
pub use error::DriftqClientError;
pub use handler::{AsyncHandler, FinishedMessage, Handler, HandlerError, Responder};
pub use lookup::{LookupClient, Producer};
pub use reader::Reader;

/// Client library result type
pub type Result<T> = std::result::Result<T, DriftqClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
