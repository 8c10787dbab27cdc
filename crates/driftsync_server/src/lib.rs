//! # driftsync server
//!
//! Reference implementation of the remote authoritative service.
//!
//! This crate provides:
//! - Push handling: schema validation, parent checks, last-write-wins
//! - Paginated pull over an append-only change log
//! - Authentication (HMAC-SHA256 device tokens)
//! - A transport-neutral HTTP entry point (`handle_http`)
//!
//! # Architecture
//!
//! The server keeps two views of the data:
//! - The current value of every record, used for conflict detection
//! - An append-only log of every accepted change, stamped with a strictly
//!   increasing storage timestamp
//!
//! Pull reads the log, so `offset` pages stay stable while new writes land:
//! anything written after a pull run started sorts after everything the run
//! can see.
//!
//! # Authentication
//!
//! ```rust,ignore
//! use driftsync_server::{AuthConfig, ServerConfig, TokenValidator};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let config = ServerConfig::new(type_order).with_auth(secret.clone());
//!
//! let validator = TokenValidator::new(AuthConfig::new(secret));
//! let token = validator.create_token("device-1", now)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod oplog;
mod server;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::RequestHandler;
pub use oplog::{RemoteStore, StoredChange};
pub use server::SyncServer;
