//! Security module
//!
//! - [`tls`]: certificate loading, ephemeral certificates and the SNI
//!   certificate store used for implicit TLS and STARTTLS

pub mod tls;

pub use tls::{CertStore, SniCallback, TlsConfig};
