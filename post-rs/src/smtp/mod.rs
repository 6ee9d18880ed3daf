//! SMTP/LMTP protocol engine (RFC 5321, RFC 2033)
//!
//! - [`stream`]: line/data splitting of the client byte stream
//! - [`commands`]: command table and address-command parsing
//! - [`sasl`]: PLAIN, LOGIN, CRAM-MD5 and XOAUTH2 exchanges
//! - [`xclient`]: XCLIENT / XFORWARD parameters
//! - [`connection`]: per-connection state machine
//! - [`server`]: listener, admission and shutdown
//! - [`handler`]: callbacks into the mail application

pub mod commands;
pub mod connection;
pub mod handler;
pub mod proxy;
pub mod reply;
pub mod sasl;
pub mod server;
pub mod session;
pub mod stream;
pub mod xclient;

pub use commands::SmtpCommand;
pub use connection::{ConnectionOptions, SmtpConnection};
pub use handler::{
    AuthRequest, AuthResponse, Credentials, DataOutcome, DefaultHandler, IncomingMessage,
    MailHandler,
};
pub use reply::Reply;
pub use sasl::AuthMethod;
pub use server::{ConnectInfo, ServerContext, ServerEvent, SmtpServer};
pub use session::{Envelope, ParsedAddress, Session, TlsInfo, TransmissionType, User};
pub use stream::{StreamEvent, StreamParser};
