//! Callback boundary between the protocol engine and the mail application
//!
//! The engine never stores mail or checks credentials itself. Every decision
//! that needs application knowledge goes through a [`MailHandler`]; the
//! default methods accept everything, so implementors only override the
//! hooks they care about.

use crate::error::Rejection;
use crate::smtp::sasl::AuthMethod;
use crate::smtp::session::{ParsedAddress, Session, TlsInfo, User};
use crate::smtp::stream::DataSummary;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Credentials collected by a SASL mechanism
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    AccessToken(String),
    /// CRAM-MD5: the challenge the server sent and the hex digest the
    /// client returned. Check it with [`AuthRequest::validate_password`].
    CramMd5 { challenge: String, response: String },
    /// XCLIENT LOGIN passthrough, no secret involved
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub method: AuthMethod,
    pub username: String,
    pub credentials: Credentials,
}

impl AuthRequest {
    pub fn password(&self) -> Option<&str> {
        match &self.credentials {
            Credentials::Password(password) => Some(password),
            _ => None,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        match &self.credentials {
            Credentials::AccessToken(token) => Some(token),
            _ => None,
        }
    }

    /// Check a stored secret against the supplied credentials.
    ///
    /// For CRAM-MD5 the secret is the HMAC key and the client digest is
    /// recomputed from the challenge; for PLAIN/LOGIN it is a plain
    /// comparison. Token and passthrough requests never validate.
    pub fn validate_password(&self, secret: &str) -> bool {
        match &self.credentials {
            Credentials::Password(password) => password == secret,
            Credentials::CramMd5 {
                challenge,
                response,
            } => {
                let Ok(mut mac) = Hmac::<Md5>::new_from_slice(secret.as_bytes()) else {
                    return false;
                };
                mac.update(challenge.as_bytes());
                hex(&mac.finalize().into_bytes()) == response.to_ascii_lowercase()
            }
            Credentials::AccessToken(_) | Credentials::None => false,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Successful answer from [`MailHandler::on_auth`].
///
/// Without a `user` the attempt counts as failed; `code` and `message`
/// then replace the default `535` reply. For XOAUTH2 `data` is sent back
/// to the client as the base64 JSON error challenge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthResponse {
    pub user: Option<User>,
    pub code: Option<u16>,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl AuthResponse {
    pub fn accept(user: User) -> Self {
        Self {
            user: Some(user),
            ..Default::default()
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Body chunks buffered between the socket and `on_data`
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Message body streamed to [`MailHandler::on_data`].
///
/// `on_data` runs as soon as DATA is accepted and the body arrives chunk by
/// chunk while the client sends it. [`byte_length`](Self::byte_length) and
/// [`size_exceeded`](Self::size_exceeded) are final once
/// [`next_chunk`](Self::next_chunk) has returned `None`. Chunks past the
/// configured `size` are counted but not delivered.
#[derive(Debug)]
pub struct IncomingMessage {
    chunks: mpsc::Receiver<Bytes>,
    summary: Option<oneshot::Receiver<DataSummary>>,
    byte_length: usize,
    size_exceeded: bool,
    complete: bool,
}

impl IncomingMessage {
    pub(crate) fn channel() -> (MessageSink, IncomingMessage) {
        let (chunk_tx, chunk_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let (summary_tx, summary_rx) = oneshot::channel();

        let sink = MessageSink {
            chunks: chunk_tx,
            summary: summary_tx,
        };
        let message = IncomingMessage {
            chunks: chunk_rx,
            summary: Some(summary_rx),
            byte_length: 0,
            size_exceeded: false,
            complete: false,
        };
        (sink, message)
    }

    /// A complete message held in memory, e.g. for exercising a handler
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let (sink, message) = Self::channel();
        let summary = DataSummary {
            byte_length: data.len(),
            size_exceeded: false,
        };
        if !data.is_empty() {
            let _ = sink.chunks.try_send(data);
        }
        sink.finish(summary);
        message
    }

    /// Next piece of the unescaped body, `None` at the end
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        if let Some(chunk) = self.chunks.recv().await {
            return Some(chunk);
        }

        if let Some(summary) = self.summary.take() {
            if let Ok(summary) = summary.await {
                self.byte_length = summary.byte_length;
                self.size_exceeded = summary.size_exceeded;
                self.complete = true;
            }
        }
        None
    }

    /// Collect the rest of the body in memory
    pub async fn read_to_end(&mut self) -> Bytes {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            body.extend_from_slice(&chunk);
        }
        body.freeze()
    }

    /// Consume the rest of the body without keeping it
    pub async fn discard(&mut self) {
        while self.next_chunk().await.is_some() {}
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// The body was larger than the configured `size`
    pub fn size_exceeded(&self) -> bool {
        self.size_exceeded
    }

    /// False when the client went away before the terminating dot
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Connection side of an [`IncomingMessage`]
#[derive(Debug)]
pub(crate) struct MessageSink {
    chunks: mpsc::Sender<Bytes>,
    summary: oneshot::Sender<DataSummary>,
}

impl MessageSink {
    /// Forward a chunk; false once the handler has dropped the body
    pub(crate) async fn send(&self, chunk: Bytes) -> bool {
        self.chunks.send(chunk).await.is_ok()
    }

    /// Report the totals and close the body
    pub(crate) fn finish(self, summary: DataSummary) {
        let _ = self.summary.send(summary);
    }
}

/// Result of [`MailHandler::on_data`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOutcome {
    /// One answer for the whole transaction; `None` uses the default text
    Accepted(Option<String>),
    /// One answer per accepted recipient, in envelope order
    PerRecipient(Vec<Result<Option<String>, Rejection>>),
}

#[async_trait]
pub trait MailHandler: Send + Sync + 'static {
    /// Called before the greeting. A rejection is sent (default 554) and
    /// the connection closed.
    async fn on_connect(&self, _session: &Session) -> Result<(), Rejection> {
        Ok(())
    }

    /// Called once TLS is established, for implicit TLS and STARTTLS
    async fn on_secure(&self, _tls: &TlsInfo, _session: &Session) -> Result<(), Rejection> {
        Ok(())
    }

    async fn on_auth(
        &self,
        request: &AuthRequest,
        _session: &Session,
    ) -> Result<AuthResponse, Rejection> {
        Ok(default_auth_response(request))
    }

    async fn on_mail_from(
        &self,
        _address: &ParsedAddress,
        _session: &Session,
    ) -> Result<(), Rejection> {
        Ok(())
    }

    async fn on_rcpt_to(
        &self,
        _address: &ParsedAddress,
        _session: &Session,
    ) -> Result<(), Rejection> {
        Ok(())
    }

    /// Called when DATA is accepted, with the body still streaming in.
    /// The reply is sent once the body has ended.
    async fn on_data(
        &self,
        mut message: IncomingMessage,
        session: &Session,
    ) -> Result<DataOutcome, Rejection> {
        message.discard().await;
        info!(
            tnx = "message",
            cid = %session.id,
            size = message.byte_length(),
            "<received {} bytes>",
            message.byte_length()
        );
        Ok(DataOutcome::Accepted(None))
    }

    async fn on_close(&self, _session: &Session) {}
}

/// Auth behaviour when the application does not implement `on_auth`:
/// XCLIENT logins pass through, XOAUTH2 gets the RFC 7628 error
/// challenge and everything else is refused.
pub fn default_auth_response(request: &AuthRequest) -> AuthResponse {
    match request.method {
        AuthMethod::Xclient => AuthResponse::accept(User::new(request.username.clone())),
        AuthMethod::Xoauth2 => AuthResponse {
            data: Some(serde_json::json!({
                "status": "401",
                "schemes": "bearer mac",
                "scope": "https://mail.google.com/",
            })),
            ..Default::default()
        },
        _ => AuthResponse::deny("Authentication not implemented"),
    }
}

/// Handler that accepts every connection, envelope and message and logs
/// the message size.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

#[async_trait]
impl MailHandler for DefaultHandler {}
