//! post-rs: SMTP/LMTP protocol engine
//!
//! The engine speaks the server side of SMTP and LMTP and leaves every
//! mail decision (who may log in, which recipients exist, what happens to
//! the message) to a [`MailHandler`](smtp::MailHandler) implementation.
//!
//! # Features
//!
//! - **Protocol**: HELO/EHLO/LHLO, MAIL/RCPT/DATA with dot-unstuffing,
//!   per-recipient LMTP replies, SIZE, PIPELINING
//! - **Authentication**: SASL PLAIN, LOGIN, CRAM-MD5 and XOAUTH2
//! - **Transport**: STARTTLS, implicit TLS, SNI certificate selection,
//!   PROXY v1 preamble, XCLIENT / XFORWARD
//! - **Admission**: client limit, idle timeout, early talker detection,
//!   graceful shutdown
//!
//! # Example
//!
//! ```no_run
//! use post_rs::config::Config;
//! use post_rs::smtp::{DefaultHandler, SmtpServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let server = SmtpServer::new(config, Arc::new(DefaultHandler))?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`smtp`]: SMTP protocol implementation
//! - [`security`]: TLS certificates and SNI

pub mod config;
pub mod error;
pub mod security;
pub mod smtp;

// Re-export commonly used types
pub use config::Config;
pub use error::{PostError, Rejection, Result};
