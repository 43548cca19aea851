//! # lsnet Transport
//!
//! Transport layer for the lsnet overlay.
//!
//! Packets travel as one JSON object per line over a freshly opened TCP
//! connection, which is closed right after the write. Delivery is best
//! effort: callers see connection failures as [`TransportError`]s and decide
//! themselves whether to retry.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lsnet_transport::{ConnectionConfig, Connector, PacketListener};
//!
//! let listener = PacketListener::bind("127.0.0.1:7001".parse()?, ConnectionConfig::default()).await?;
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
//! tokio::spawn(listener.run(Arc::new(tx), shutdown_tx.subscribe()));
//!
//! Connector::default().send("127.0.0.1:7001".parse()?, &packet).await?;
//! let received = rx.recv().await;
//! ```

pub mod connection;
pub mod error;
pub mod listener;

// Re-export main types
pub use connection::{ConnectionConfig, Connector};
pub use error::{TransportError, TransportResult};
pub use listener::{PacketListener, PacketSink};
