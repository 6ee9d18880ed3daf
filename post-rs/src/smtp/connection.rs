//! Per-connection SMTP/LMTP state machine
//!
//! One [`SmtpConnection`] owns one socket from the greeting to the close.
//! Input goes through the sans-IO [`StreamParser`]; every parsed line runs
//! through the same guard sequence before it reaches a command handler:
//!
//! 1. nothing may be sent before the greeting (`421 You talk too soon`)
//! 2. a pending SASL continuation takes the line as is
//! 3. lines arriving while TLS is being negotiated are dropped
//! 4. unknown or disabled verbs get `500`, the tenth one `421`
//! 5. MAIL/RCPT/DATA/AUTH need HELO/EHLO/LHLO first (`503`)
//! 6. MAIL/RCPT/DATA need authentication unless it is optional (`530`)
//!
//! # Security features
//! - Idle timeout with `421`
//! - Unrecognized and unauthenticated command ceilings
//! - Early talker detection before the greeting
//! - STARTTLS drops everything pipelined behind it
//! - XCLIENT can only be used once per connection

use crate::error::{PostError, Rejection, Result};
use crate::security::tls::tls_info;
use crate::security::TlsConfig;
use crate::smtp::commands::{command_verb, parse_address_command, SmtpCommand};
use crate::smtp::handler::{DataOutcome, IncomingMessage, MessageSink};
use crate::smtp::reply::Reply;
use crate::smtp::sasl::{self, AuthMethod, AuthOutcome, SaslState, SaslStep};
use crate::smtp::server::{ConnectInfo, ServerContext, ServerEvent};
use crate::smtp::session::{Envelope, Session, TransmissionType};
use crate::smtp::stream::{DataSummary, StreamEvent, StreamParser};
use crate::smtp::xclient::{self, Extension};
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trust_dns_resolver::TokioAsyncResolver;

/// Unrecognized commands allowed before the connection is dropped
const MAX_UNRECOGNIZED_COMMANDS: usize = 10;

/// Window in which a client must stay silent before the greeting
const EARLY_TALKER_DELAY: Duration = Duration::from_millis(100);

const READ_BUFFER_SIZE: usize = 8192;

/// Time allowed for the final reply when the server shuts down
const SHUTDOWN_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Unified stream type for both plain and TLS connections
///
/// STARTTLS swaps `Plain` for `Tls` in place; `Upgrading` only exists while
/// the handshake owns the socket.
pub enum SmtpStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    Upgrading,
}

fn upgrading_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is being upgraded to TLS")
}

impl<S> AsyncRead for SmtpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

impl<S> AsyncWrite for SmtpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

/// Socket facts known when the connection is created
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub id: String,
    pub local_addr: SocketAddr,
    /// Peer address, or the one announced in a PROXY header
    pub remote_addr: SocketAddr,
    /// Host listed in `ignored_hosts`
    pub ignore: bool,
}

/// A line handler installed by a multi-step exchange
#[derive(Debug, Clone, PartialEq, Eq)]
enum Continuation {
    Sasl(SaslState),
}

/// A DATA transfer in progress: the body sink and the `on_data` task
struct PendingData {
    sink: MessageSink,
    task: JoinHandle<std::result::Result<DataOutcome, Rejection>>,
    forwarded: usize,
    /// The handler still reads the body
    open: bool,
}

enum Startup {
    Ready(String),
    EarlyTalker(usize),
    Closed,
}

pub struct SmtpConnection<S> {
    stream: SmtpStream<S>,
    parser: StreamParser,
    session: Session,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
    read_buf: Vec<u8>,
    /// Greeting sent, client input is accepted
    ready: bool,
    upgrading: bool,
    closing: bool,
    pending: Option<Continuation>,
    data: Option<PendingData>,
    unrecognized_commands: usize,
    unauthenticated_commands: usize,
    transaction_counter: u64,
    can_emit_connection: bool,
}

impl<S> SmtpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Connection over a plain socket. With `secured` set in the
    /// configuration the socket is treated as already encrypted.
    pub fn new(
        stream: S,
        options: ConnectionOptions,
        ctx: Arc<ServerContext>,
        shutdown: CancellationToken,
    ) -> Self {
        let secured = ctx.config.tls.secured;
        let mut connection = Self::build(SmtpStream::Plain(stream), options, ctx, shutdown);
        connection.session.secure = secured;
        connection
    }

    /// Connection over a socket whose TLS handshake the listener already did
    pub fn with_tls(
        stream: TlsStream<S>,
        options: ConnectionOptions,
        ctx: Arc<ServerContext>,
        shutdown: CancellationToken,
    ) -> Self {
        let info = tls_info(stream.get_ref().1);
        let mut connection =
            Self::build(SmtpStream::Tls(Box::new(stream)), options, ctx, shutdown);
        connection.session.secure = true;
        connection.session.servername = info.servername.clone();
        connection.session.tls = Some(info);
        connection
    }

    fn build(
        stream: SmtpStream<S>,
        options: ConnectionOptions,
        ctx: Arc<ServerContext>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut session = Session::new(options.id);
        session.local_address = options.local_addr.ip();
        session.local_port = options.local_addr.port();
        session.remote_address = options.remote_addr.ip();
        session.remote_port = options.remote_addr.port();
        session.ignore = options.ignore;

        Self {
            stream,
            parser: StreamParser::new(),
            session,
            ctx,
            shutdown,
            read_buf: vec![0u8; READ_BUFFER_SIZE],
            ready: false,
            upgrading: false,
            closing: false,
            pending: None,
            data: None,
            unrecognized_commands: 0,
            unauthenticated_commands: 0,
            transaction_counter: 0,
            can_emit_connection: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    /// Drive the connection until it closes. Errors are logged and
    /// reported as [`ServerEvent::Error`]; `on_close` always runs.
    ///
    /// Cancelling the shutdown token interrupts whatever the connection is
    /// waiting on (a read, a handshake or a handler callback) and sends
    /// `421 Server shutting down`.
    pub async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        let served = tokio::select! {
            biased;
            result = self.serve() => Some(result),
            _ = shutdown.cancelled() => None,
        };

        match served {
            Some(Ok(())) => {}
            Some(Err(e)) => self.on_error(e),
            None => self.shut_down().await,
        }
        self.close().await;
    }

    async fn serve(&mut self) -> Result<()> {
        if self.ctx.config.tls.secure && self.ctx.config.tls.needs_upgrade && !self.session.secure {
            let tls = self.ctx.tls.clone().ok_or_else(|| {
                PostError::Tls("implicit TLS requested but no TLS configuration".to_string())
            })?;
            self.upgrade(&tls).await?;
        }

        match self.prepare().await? {
            Startup::Closed => return Ok(()),
            Startup::EarlyTalker(n) => {
                debug!(cid = %self.session.id, bytes = n, "Client sent data before greeting");
                return self.send(self.too_soon()).await;
            }
            Startup::Ready(hostname) => self.session.client_hostname = hostname,
        }

        self.reset_session();

        if let Err(rejection) = self.ctx.handler.on_connect(&self.session).await {
            self.log_connection();
            self.send(Reply::new(rejection.code_or(554), rejection.message)).await?;
            self.closing = true;
            return Ok(());
        }
        self.log_connection();

        if self.session.secure {
            if let Some(info) = self.session.tls.clone() {
                if let Err(rejection) = self.ctx.handler.on_secure(&info, &self.session).await {
                    return self.reject_secure(rejection).await;
                }
            }
        }

        self.ready = true;
        if !self.ctx.config.smtp.use_xclient && !self.ctx.config.smtp.use_xforward {
            self.emit_connection();
        }
        self.send(self.greeting()).await?;

        self.command_loop().await
    }

    /// Wait out the early talker window and resolve the client hostname.
    /// Any byte arriving meanwhile aborts the wait.
    async fn prepare(&mut self) -> Result<Startup> {
        let remote = self.session.remote_address;
        let resolver = if self.ctx.config.server.disable_reverse_lookup {
            None
        } else {
            self.ctx.resolver.clone()
        };
        let lookup_timeout = self.ctx.config.reverse_lookup_timeout();
        let cid = self.session.id.clone();

        let preparation = async move {
            sleep(EARLY_TALKER_DELAY).await;
            match resolver {
                Some(resolver) => reverse_lookup(&resolver, remote, lookup_timeout, &cid).await,
                None => None,
            }
        };

        let startup = tokio::select! {
            hostname = preparation => {
                Startup::Ready(hostname.unwrap_or_else(|| format!("[{}]", remote)))
            }
            read = self.stream.read(&mut self.read_buf) => match read? {
                0 => Startup::Closed,
                n => Startup::EarlyTalker(n),
            },
        };

        Ok(startup)
    }

    async fn command_loop(&mut self) -> Result<()> {
        let idle = self.ctx.config.socket_timeout();

        loop {
            self.process_input().await?;
            if self.closing {
                return Ok(());
            }

            match timeout(idle, self.stream.read(&mut self.read_buf)).await {
                Err(_elapsed) => {
                    self.send(Reply::new(421, "Timeout - closing connection")).await?;
                    return Ok(());
                }
                Ok(Ok(0)) => {
                    self.parser.finish();
                    self.process_input().await?;
                    return Ok(());
                }
                Ok(Ok(n)) => self.parser.feed(&self.read_buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Handle everything the parser can produce from buffered input
    async fn process_input(&mut self) -> Result<()> {
        while !self.closing {
            let Some(event) = self.parser.next_event() else {
                break;
            };

            match event {
                StreamEvent::Command(line) => {
                    let line = String::from_utf8_lossy(&line).into_owned();
                    self.on_command(&line).await?;
                }
                StreamEvent::Data(chunk) => self.forward_data(chunk).await,
                StreamEvent::DataEnd(summary) => self.finish_data(summary).await?,
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, line: &str) -> Result<()> {
        let verb = command_verb(line);
        debug!(
            tnx = "command",
            cid = %self.session.id,
            command = %verb,
            user = ?self.session.username(),
            "C: {}",
            line
        );

        if !self.ready {
            // block spammers that send payloads before the greeting
            return self.send(self.too_soon()).await;
        }

        if let Some(Continuation::Sasl(state)) = self.pending.take() {
            return self.run_sasl(sasl::resume(state, line)).await;
        }

        if self.upgrading {
            debug!(cid = %self.session.id, "Ignoring command during TLS upgrade");
            return Ok(());
        }

        let Some(command) = SmtpCommand::from_verb(&verb).filter(|c| self.is_supported(*c)) else {
            self.unrecognized_commands += 1;
            if self.unrecognized_commands >= MAX_UNRECOGNIZED_COMMANDS {
                return self
                    .send(Reply::new(421, "Error: too many unrecognized commands"))
                    .await;
            }
            return self.send(Reply::new(500, "Error: command not recognized")).await;
        };

        let auth_enforced = !self.session.is_authenticated()
            && self.is_supported(SmtpCommand::Auth)
            && !self.ctx.config.smtp.auth_optional;

        if auth_enforced && command != SmtpCommand::Auth {
            if let Some(max) = self
                .ctx
                .config
                .smtp
                .max_allowed_unauthenticated_commands
                .filter(|max| *max > 0)
            {
                self.unauthenticated_commands += 1;
                if self.unauthenticated_commands >= max {
                    return self
                        .send(Reply::new(421, "Error: too many unauthenticated commands"))
                        .await;
                }
            }
        }

        if self.session.host_name_appears_as.is_none() && command.requires_greeting() {
            let hello = if self.ctx.config.server.lmtp {
                "LHLO"
            } else {
                "HELO/EHLO"
            };
            return self
                .send(Reply::new(503, format!("Error: send {} first", hello)))
                .await;
        }

        if auth_enforced && command.requires_auth() {
            let text = self
                .ctx
                .config
                .smtp
                .auth_required_message
                .clone()
                .unwrap_or_else(|| "Error: authentication Required".to_string());
            return self.send(Reply::new(530, text)).await;
        }

        self.dispatch(command, line).await
    }

    async fn dispatch(&mut self, command: SmtpCommand, line: &str) -> Result<()> {
        match command {
            SmtpCommand::Ehlo | SmtpCommand::Lhlo => self.handle_ehlo(command, line).await,
            SmtpCommand::Helo => self.handle_helo(line).await,
            SmtpCommand::Starttls => self.handle_starttls().await,
            SmtpCommand::Auth => self.handle_auth(line).await,
            SmtpCommand::Mail => self.handle_mail(line).await,
            SmtpCommand::Rcpt => self.handle_rcpt(line).await,
            SmtpCommand::Data => self.handle_data().await,
            SmtpCommand::Rset => {
                self.reset_session();
                self.send(Reply::new(250, "Flushed")).await
            }
            SmtpCommand::Noop => self.send(Reply::new(250, "OK")).await,
            SmtpCommand::Quit => {
                self.send(Reply::new(221, "Bye")).await?;
                self.closing = true;
                Ok(())
            }
            SmtpCommand::Vrfy => {
                self.send(Reply::new(252, "Try to send something. No promises though"))
                    .await
            }
            SmtpCommand::Help => {
                self.send(Reply::new(
                    214,
                    "See https://tools.ietf.org/html/rfc5321 for details",
                ))
                .await
            }
            SmtpCommand::Xclient => self.handle_xclient(line).await,
            SmtpCommand::Xforward => self.handle_xforward(line).await,
            SmtpCommand::Wiz => self.handle_wiz(line).await,
            SmtpCommand::Shell => self.handle_shell().await,
            SmtpCommand::Kill => {
                info!(
                    tnx = "kill",
                    cid = %self.session.id,
                    user = ?self.session.username(),
                    "Client tried to invoke KILL"
                );
                self.send(Reply::new(500, "Can not kill Mom")).await
            }
        }
    }

    // COMMAND HANDLERS

    async fn handle_ehlo(&mut self, command: SmtpCommand, line: &str) -> Result<()> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 2 {
            let verb = if self.ctx.config.server.lmtp { "LHLO" } else { "EHLO" };
            return self
                .send(Reply::new(501, format!("Error: syntax: {} hostname", verb)))
                .await;
        }

        self.session.host_name_appears_as = Some(parts[1].to_lowercase());
        self.session.opening_command = Some(command.as_str().to_string());

        let mut lines = vec![format!(
            "{} Nice to meet you, {}",
            self.ctx.name, self.session.client_hostname
        )];
        lines.extend(self.capabilities());

        // EHLO is effectively the same as RSET
        self.reset_session();
        self.send(Reply::multiline(250, lines)).await
    }

    async fn handle_helo(&mut self, line: &str) -> Result<()> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 2 {
            return self
                .send(Reply::new(501, "Error: syntax: HELO hostname"))
                .await;
        }

        self.session.host_name_appears_as = Some(parts[1].to_lowercase());
        self.session.opening_command = Some("HELO".to_string());

        self.reset_session();
        let text = format!(
            "{} Nice to meet you, {}",
            self.ctx.name, self.session.client_hostname
        );
        self.send(Reply::new(250, text)).await
    }

    fn capabilities(&self) -> Vec<String> {
        let smtp = &self.ctx.config.smtp;
        let mut features = Vec::new();

        if !smtp.hide_pipelining {
            features.push("PIPELINING".to_string());
        }
        if !smtp.hide_8bitmime {
            features.push("8BITMIME".to_string());
        }
        if !smtp.hide_smtputf8 {
            features.push("SMTPUTF8".to_string());
        }

        if !smtp.auth_methods.is_empty()
            && self.is_supported(SmtpCommand::Auth)
            && !self.session.is_authenticated()
        {
            features.push(format!("AUTH {}", smtp.auth_methods.join(" ")));
        }

        if !self.session.secure && self.starttls_available() {
            features.push("STARTTLS".to_string());
        }

        if let Some(size) = self.ctx.config.max_message_size() {
            if smtp.hide_size {
                features.push("SIZE".to_string());
            } else {
                features.push(format!("SIZE {}", size));
            }
        }

        // XCLIENT ADDR drops any special privileges of the client
        let privileged = !self.session.xclient.contains_key("ADDR");
        if privileged && smtp.use_xclient && self.is_supported(SmtpCommand::Xclient) {
            features.push("XCLIENT NAME ADDR PORT PROTO HELO LOGIN".to_string());
        }
        if privileged && smtp.use_xforward && self.is_supported(SmtpCommand::Xforward) {
            features.push("XFORWARD NAME ADDR PORT PROTO HELO IDENT SOURCE".to_string());
        }

        features
    }

    async fn handle_starttls(&mut self) -> Result<()> {
        if self.session.secure {
            return self.send(Reply::new(503, "Error: TLS already active")).await;
        }

        let Some(tls) = self.ctx.tls.clone() else {
            return self.send(Reply::new(454, "Error: TLS not available")).await;
        };

        self.send(Reply::new(220, "Ready to start TLS")).await?;

        // anything pipelined behind STARTTLS is plaintext and must not be trusted
        self.upgrading = true;
        self.parser.clear();
        self.upgrade(&tls).await?;
        self.upgrading = false;

        // a new EHLO is required on the protected channel
        self.session.host_name_appears_as = None;
        self.session.opening_command = None;
        self.session.user = None;
        self.reset_session();

        if let Some(info) = self.session.tls.clone() {
            if let Err(rejection) = self.ctx.handler.on_secure(&info, &self.session).await {
                return self.reject_secure(rejection).await;
            }
        }

        Ok(())
    }

    async fn handle_auth(&mut self, line: &str) -> Result<()> {
        let args: Vec<&str> = line.split_whitespace().skip(1).collect();
        let method_name = args.first().map(|m| m.to_ascii_uppercase()).unwrap_or_default();

        if !self.session.secure
            && self.starttls_available()
            && !self.ctx.config.smtp.allow_insecure_auth
        {
            return self
                .send(Reply::new(538, "Error: Must issue a STARTTLS command first"))
                .await;
        }

        if self.session.is_authenticated() {
            return self
                .send(Reply::new(503, "Error: No identity changes permitted"))
                .await;
        }

        let method = AuthMethod::from_name(&method_name)
            .filter(|_| self.ctx.config.allows_auth_method(&method_name));
        let Some(method) = method else {
            return self
                .send(Reply::new(504, "Error: Unrecognized authentication type"))
                .await;
        };

        let args = args.get(1..).unwrap_or_default();
        self.run_sasl(sasl::start(method, args, &self.ctx.name)).await
    }

    async fn run_sasl(&mut self, step: SaslStep) -> Result<()> {
        let request = match step {
            SaslStep::Reply(reply) => return self.send(reply).await,
            SaslStep::Challenge(reply, state) => {
                self.pending = Some(Continuation::Sasl(state));
                return self.send(reply).await;
            }
            SaslStep::Verify(request) => request,
        };

        let result = self.ctx.handler.on_auth(&request, &self.session).await;
        let outcome = sasl::conclude(&request, result);
        let cid = self.session.id.clone();
        let method = request.method.as_str();
        let username = request.username.as_str();

        match outcome {
            AuthOutcome::Authenticated(user) => {
                info!(
                    tnx = "auth",
                    cid = %cid,
                    method,
                    user = username,
                    "{} authenticated using {}",
                    username,
                    method
                );
                self.session.user = Some(user);
                self.session.transmission_type = self.transmission_type();
                self.send(Reply::new(235, "Authentication successful")).await
            }
            AuthOutcome::Failed(reply) => {
                info!(
                    tnx = "authfail",
                    cid = %cid,
                    method,
                    user = username,
                    "Authentication failed for {} using {}",
                    username,
                    method
                );
                self.send(reply).await
            }
            AuthOutcome::Rejected(reply) => {
                info!(
                    tnx = "autherror",
                    cid = %cid,
                    method,
                    user = username,
                    "Authentication error for {} using {}. {}",
                    username,
                    method,
                    reply.lines.join(" ")
                );
                self.send(reply).await
            }
            AuthOutcome::Challenge(reply, state) => {
                info!(
                    tnx = "authfail",
                    cid = %cid,
                    method,
                    user = username,
                    "Authentication failed for {} using {}",
                    username,
                    method
                );
                self.pending = Some(Continuation::Sasl(state));
                self.send(reply).await
            }
        }
    }

    async fn handle_mail(&mut self, line: &str) -> Result<()> {
        let parsed = parse_address_command("MAIL FROM", line);

        // in case the connection was not announced yet
        self.emit_connection();

        let Some(parsed) = parsed else {
            return self
                .send(Reply::new(501, "Error: Bad sender address syntax"))
                .await;
        };

        if self.session.envelope.in_transaction() {
            return self.send(Reply::new(503, "Error: nested MAIL command")).await;
        }

        let smtp = &self.ctx.config.smtp;
        if let Some(max) = self.ctx.config.max_message_size().filter(|_| !smtp.hide_size) {
            let declared = parsed.arg("SIZE").and_then(|size| size.parse::<u64>().ok());
            if declared.map_or(false, |size| size > max as u64) {
                let text = format!("Error: message exceeds fixed maximum message size {}", max);
                return self.send(Reply::new(552, text)).await;
            }
        }

        match self.ctx.handler.on_mail_from(&parsed, &self.session).await {
            Err(rejection) => {
                self.send(Reply::new(rejection.code_or(550), rejection.message))
                    .await
            }
            Ok(()) => {
                info!(
                    tnx = "mail",
                    cid = %self.session.id,
                    "MAIL FROM: <{}>",
                    parsed.address
                );
                self.session.envelope.mail_from = Some(parsed);
                self.send(Reply::new(250, "Accepted")).await
            }
        }
    }

    async fn handle_rcpt(&mut self, line: &str) -> Result<()> {
        // the recipient address can not be empty
        let parsed = parse_address_command("RCPT TO", line).filter(|p| !p.address.is_empty());
        let Some(parsed) = parsed else {
            return self
                .send(Reply::new(501, "Error: Bad recipient address syntax"))
                .await;
        };

        if !self.session.envelope.in_transaction() {
            return self.send(Reply::new(503, "Error: need MAIL command")).await;
        }

        match self.ctx.handler.on_rcpt_to(&parsed, &self.session).await {
            Err(rejection) => {
                self.send(Reply::new(rejection.code_or(550), rejection.message))
                    .await
            }
            Ok(()) => {
                debug!(cid = %self.session.id, "RCPT TO: <{}>", parsed.address);
                self.session.envelope.add_recipient(parsed);
                self.send(Reply::new(250, "Accepted")).await
            }
        }
    }

    async fn handle_data(&mut self) -> Result<()> {
        if self.session.envelope.rcpt_to.is_empty() {
            return self.send(Reply::new(503, "Error: need RCPT command")).await;
        }

        self.parser.start_data_mode(self.ctx.config.max_message_size());

        // the handler reads the body while the client is still sending it
        let (sink, message) = IncomingMessage::channel();
        let handler = Arc::clone(&self.ctx.handler);
        let session = self.session.clone();
        let task = tokio::spawn(async move { handler.on_data(message, &session).await });
        self.data = Some(PendingData {
            sink,
            task,
            forwarded: 0,
            open: true,
        });

        self.send(Reply::new(354, "End data with <CR><LF>.<CR><LF>"))
            .await
    }

    /// Pass a body chunk to `on_data`. Nothing past the size limit is
    /// delivered; the parser keeps counting it for the summary.
    async fn forward_data(&mut self, chunk: Bytes) {
        let limit = self.ctx.config.max_message_size();
        let Some(pending) = self.data.as_mut() else {
            return;
        };

        if !pending.open || limit.map_or(false, |max| pending.forwarded > max) {
            return;
        }

        pending.forwarded += chunk.len();
        pending.open = pending.sink.send(chunk).await;
    }

    async fn finish_data(&mut self, summary: DataSummary) -> Result<()> {
        let result = match self.data.take() {
            Some(pending) => {
                pending.sink.finish(summary);
                match pending.task.await {
                    Ok(result) => result,
                    Err(e) => {
                        let message = format!("on_data failed: {}", e);
                        error!(tnx = "message", cid = %self.session.id, "{}", message);
                        self.ctx.emit(ServerEvent::Error {
                            id: Some(self.session.id.clone()),
                            message,
                        });
                        Err(Rejection::with_code(451, "Error: message processing failed"))
                    }
                }
            }
            None => Err(Rejection::with_code(451, "Error: message processing failed")),
        };

        for reply in self.data_replies(result) {
            self.send(reply).await?;
        }

        self.transaction_counter += 1;
        self.unrecognized_commands = 0;
        self.reset_session();
        self.parser.resume();
        Ok(())
    }

    fn data_replies(&self, result: std::result::Result<DataOutcome, Rejection>) -> Vec<Reply> {
        let lmtp = self.ctx.config.server.lmtp;
        let rcpt_count = self.session.envelope.rcpt_to.len();
        let per_transaction = if lmtp { rcpt_count } else { 1 };

        match result {
            Err(rejection) => {
                vec![Reply::new(rejection.code_or(450), rejection.message); per_transaction]
            }
            Ok(DataOutcome::Accepted(message)) => {
                let default = if lmtp {
                    "OK: message accepted"
                } else {
                    "OK: message queued"
                };
                let text = message.unwrap_or_else(|| default.to_string());
                vec![Reply::new(250, text); per_transaction]
            }
            Ok(DataOutcome::PerRecipient(responses)) if responses.len() != rcpt_count => {
                let message = format!(
                    "on_data returned {} responses for {} recipients",
                    responses.len(),
                    rcpt_count
                );
                error!(tnx = "message", cid = %self.session.id, "{}", message);
                self.ctx.emit(ServerEvent::Error {
                    id: Some(self.session.id.clone()),
                    message,
                });
                vec![Reply::new(451, "Error: message processing failed"); per_transaction]
            }
            Ok(DataOutcome::PerRecipient(responses)) => responses
                .into_iter()
                .map(|response| match response {
                    Ok(message) => Reply::new(
                        250,
                        message.unwrap_or_else(|| "OK: message accepted".to_string()),
                    ),
                    Err(rejection) => Reply::new(rejection.code_or(450), rejection.message),
                })
                .collect(),
        }
    }

    async fn handle_xclient(&mut self, line: &str) -> Result<()> {
        if self.session.xclient.contains_key("ADDR") || !self.ctx.config.smtp.use_xclient {
            return self.send(Reply::new(550, "Error: Not allowed")).await;
        }

        // not allowed to change properties while processing mail
        if self.session.envelope.in_transaction() {
            return self
                .send(Reply::new(503, "Error: Mail transaction in progress"))
                .await;
        }

        let params = match xclient::parse(Extension::Xclient, command_args(line)) {
            Ok(params) => params,
            Err(e) => return self.send(e.reply()).await,
        };

        for (key, value) in &params.entries {
            match key.as_str() {
                "ADDR" => {
                    if let Some(addr) = params.addr() {
                        info!(
                            tnx = "xclient",
                            cid = %self.session.id,
                            xclient_key = "ADDR",
                            xclient = %addr,
                            "XCLIENT from {} through {}",
                            addr,
                            self.session.remote_address
                        );
                        self.remember_default("ADDR:DEFAULT", self.session.remote_address.to_string());
                        self.session.remote_address = addr;
                        // require a fresh HELO/EHLO
                        self.session.host_name_appears_as = None;
                    }
                }
                "NAME" => {
                    info!(
                        tnx = "xclient",
                        cid = %self.session.id,
                        xclient_key = "NAME",
                        xclient = %value,
                        "XCLIENT hostname resolved as \"{}\"",
                        value
                    );
                    self.remember_default("NAME:DEFAULT", self.session.client_hostname.clone());
                    self.session.client_hostname = value.to_lowercase();
                }
                "PORT" => {
                    if let Ok(port) = value.parse::<u16>() {
                        info!(
                            tnx = "xclient",
                            cid = %self.session.id,
                            xclient_key = "PORT",
                            xclient = port,
                            "XCLIENT remote port resolved as \"{}\"",
                            port
                        );
                        self.remember_default("PORT:DEFAULT", self.session.remote_port.to_string());
                        self.session.remote_port = port;
                    }
                }
                _ => {}
            }
            self.session.xclient.insert(key.clone(), value.clone());
        }

        if self.session.client_hostname.is_empty() {
            self.session.client_hostname = format!("[{}]", self.session.remote_address);
        }

        if params.has("ADDR") {
            self.emit_connection();
        }

        if let Some(login) = params.get("LOGIN") {
            if login.is_empty() {
                info!(
                    tnx = "deauth",
                    cid = %self.session.id,
                    user = ?self.session.username(),
                    "User deauthenticated using XCLIENT"
                );
                self.session.user = None;
            } else {
                let request = sasl::xclient_request(login);
                let result = self.ctx.handler.on_auth(&request, &self.session).await;
                match sasl::conclude_xclient(result) {
                    Ok(user) => {
                        info!(
                            tnx = "auth",
                            cid = %self.session.id,
                            method = "XCLIENT",
                            user = %user.username,
                            "{} authenticated using XCLIENT",
                            user.username
                        );
                        self.session.user = Some(user);
                    }
                    Err(message) => {
                        info!(
                            tnx = "authfail",
                            cid = %self.session.id,
                            method = "XCLIENT",
                            user = %request.username,
                            "Authentication failed for {} using XCLIENT",
                            request.username
                        );
                        self.send(Reply::new(550, message)).await?;
                        self.closing = true;
                        return Ok(());
                    }
                }
            }
        }

        self.session.transmission_type = self.transmission_type();
        self.send(self.greeting()).await
    }

    async fn handle_xforward(&mut self, line: &str) -> Result<()> {
        if !self.ctx.config.smtp.use_xforward {
            return self.send(Reply::new(550, "Error: Not allowed")).await;
        }

        if self.session.envelope.in_transaction() {
            return self
                .send(Reply::new(503, "Error: Mail transaction in progress"))
                .await;
        }

        let params = match xclient::parse(Extension::Xforward, command_args(line)) {
            Ok(params) => params,
            Err(e) => return self.send(e.reply()).await,
        };

        let mut has_addr = false;
        for (key, value) in &params.entries {
            match key.as_str() {
                "ADDR" => {
                    if let Some(addr) = params.addr() {
                        info!(
                            tnx = "xforward",
                            cid = %self.session.id,
                            xforward_key = "ADDR",
                            xforward = %addr,
                            "XFORWARD from {} through {}",
                            addr,
                            self.session.remote_address
                        );
                        self.remember_default("ADDR:DEFAULT", self.session.remote_address.to_string());
                        self.session.remote_address = addr;
                        has_addr = true;
                    }
                }
                "NAME" => self.session.client_hostname = value.to_lowercase(),
                _ => {}
            }
            self.session.xforward.insert(key.clone(), value.clone());
        }

        if has_addr {
            self.can_emit_connection = true;
            self.emit_connection();
        }

        self.send(Reply::new(250, "OK")).await
    }

    async fn handle_wiz(&mut self, line: &str) -> Result<()> {
        let password = line.split_whitespace().nth(1).unwrap_or("");
        if password.is_empty() {
            return self.send(Reply::new(500, "You are no wizard!")).await;
        }

        // every password passes; the flag grants nothing
        self.session.is_wizard = true;
        self.send(Reply::new(200, "Please pass, oh mighty wizard")).await
    }

    async fn handle_shell(&mut self) -> Result<()> {
        info!(
            tnx = "shell",
            cid = %self.session.id,
            user = ?self.session.username(),
            "Client tried to invoke SHELL"
        );

        if !self.session.is_wizard {
            return self
                .send(Reply::new(500, "Mere mortals must not mutter that mantra"))
                .await;
        }

        self.send(Reply::new(
            500,
            "Error: Invoking shell is not allowed. This incident will be reported.",
        ))
        .await
    }

    // HELPERS

    /// Write one reply. A 421 always closes the connection afterwards.
    async fn send(&mut self, reply: Reply) -> Result<()> {
        let payload = reply.payload();
        if reply.is_error() {
            self.session.error = Some(payload.clone());
        }

        self.stream.write_all(reply.to_wire().as_bytes()).await?;
        self.stream.flush().await?;
        debug!(
            tnx = "send",
            cid = %self.session.id,
            user = ?self.session.username(),
            "S: {}",
            payload
        );

        if reply.code == 421 {
            self.closing = true;
        }
        Ok(())
    }

    fn greeting(&self) -> Reply {
        let protocol = if self.ctx.config.server.lmtp { "LMTP" } else { "ESMTP" };
        let text = match &self.ctx.config.server.banner {
            Some(banner) => format!("{} {} {}", self.ctx.name, protocol, banner),
            None => format!("{} {}", self.ctx.name, protocol),
        };
        Reply::new(220, text)
    }

    fn too_soon(&self) -> Reply {
        Reply::new(421, format!("{} You talk too soon", self.ctx.name))
    }

    fn is_supported(&self, command: SmtpCommand) -> bool {
        if command == SmtpCommand::Lhlo && !self.ctx.config.server.lmtp {
            return false;
        }
        !self.ctx.config.is_disabled(command.as_str())
    }

    fn starttls_available(&self) -> bool {
        self.ctx.tls.is_some()
            && self.is_supported(SmtpCommand::Starttls)
            && !self.ctx.config.smtp.hide_starttls
    }

    fn transmission_type(&self) -> TransmissionType {
        TransmissionType {
            lmtp: self.ctx.config.server.lmtp,
            extended: matches!(self.session.opening_command.as_deref(), Some("EHLO") | Some("LHLO")),
            secure: self.session.secure,
            authenticated: self.session.is_authenticated(),
        }
    }

    /// Start a new transaction. The authenticated user is kept.
    fn reset_session(&mut self) {
        self.session.envelope = Envelope::default();
        self.session.transaction = self.transaction_counter + 1;
        self.session.transmission_type = self.transmission_type();
    }

    fn remember_default(&mut self, key: &str, value: String) {
        self.session
            .xclient
            .entry(key.to_string())
            .or_insert(value);
    }

    fn emit_connection(&mut self) {
        if !self.can_emit_connection {
            return;
        }
        self.can_emit_connection = false;

        self.ctx.emit(ServerEvent::Connect(ConnectInfo {
            id: self.session.id.clone(),
            local_address: self.session.local_address,
            local_port: self.session.local_port,
            remote_address: self.session.remote_address,
            remote_port: self.session.remote_port,
            host_name_appears_as: self.session.host_name_appears_as.clone(),
            client_hostname: self.session.client_hostname.clone(),
        }));
    }

    fn log_connection(&self) {
        if self.session.ignore {
            return;
        }
        info!(
            tnx = "connection",
            cid = %self.session.id,
            host = %self.session.remote_address,
            hostname = %self.session.client_hostname,
            "Connection from {}",
            self.session.client_hostname
        );
    }

    async fn reject_secure(&mut self, rejection: Rejection) -> Result<()> {
        warn!(
            tnx = "starttls",
            cid = %self.session.id,
            "TLS session rejected: {}",
            rejection.message
        );
        self.send(Reply::new(rejection.code_or(554), rejection.message))
            .await?;
        self.closing = true;
        Ok(())
    }

    /// Run the server side of a TLS handshake on the current socket
    async fn upgrade(&mut self, tls: &TlsConfig) -> Result<()> {
        let plain = match std::mem::replace(&mut self.stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(stream) => stream,
            other => {
                self.stream = other;
                return Err(PostError::Protocol(
                    "TLS upgrade requested on a stream that is not plain".to_string(),
                ));
            }
        };

        let handshake = timeout(self.ctx.config.socket_timeout(), tls.acceptor().accept(plain)).await;
        let stream = match handshake {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(PostError::Tls(format!("TLS handshake failed: {}", e))),
            Err(_) => return Err(PostError::Tls("TLS handshake timed out".to_string())),
        };

        let info = tls_info(stream.get_ref().1);
        info!(
            tnx = "starttls",
            cid = %self.session.id,
            user = ?self.session.username(),
            cipher = ?info.cipher,
            "Connection upgraded to TLS using {}",
            info.cipher.as_deref().unwrap_or("N/A")
        );

        self.stream = SmtpStream::Tls(Box::new(stream));
        self.session.secure = true;
        self.session.servername = info.servername.clone();
        self.session.tls = Some(info);
        self.session.transmission_type = self.transmission_type();
        Ok(())
    }

    fn on_error(&mut self, err: PostError) {
        let benign = match &err {
            PostError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        };

        // a dirty disconnect outside of a transaction is just the client leaving
        if benign && !self.session.envelope.in_transaction() {
            debug!(
                tnx = "close",
                cid = %self.session.id,
                "Connection dropped by peer: {}",
                err
            );
            return;
        }

        error!(
            tnx = "error",
            cid = %self.session.id,
            user = ?self.session.username(),
            "{} {} {}",
            self.session.id,
            self.session.remote_address,
            err
        );
        self.ctx.emit(ServerEvent::Error {
            id: Some(self.session.id.clone()),
            message: err.to_string(),
        });
    }

    /// Tell the client the server is going away
    async fn shut_down(&mut self) {
        info!(tnx = "close", cid = %self.session.id, "Closing connection on server shutdown");
        let reply = Reply::new(421, "Server shutting down");
        match timeout(SHUTDOWN_REPLY_TIMEOUT, self.send(reply)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(cid = %self.session.id, "Failed to send shutdown reply: {}", e),
            Err(_) => debug!(cid = %self.session.id, "Timed out sending shutdown reply"),
        }
    }

    async fn close(&mut self) {
        self.parser.close();
        // an unfinished body reaches the handler as incomplete
        self.data = None;
        if !matches!(self.stream, SmtpStream::Upgrading) {
            let _ = timeout(SHUTDOWN_REPLY_TIMEOUT, self.stream.shutdown()).await;
        }

        info!(
            tnx = "close",
            cid = %self.session.id,
            host = %self.session.remote_address,
            user = ?self.session.username(),
            "Connection closed to {}",
            if self.session.client_hostname.is_empty() {
                self.session.remote_address.to_string()
            } else {
                self.session.client_hostname.clone()
            }
        );

        self.ctx.handler.on_close(&self.session).await;
    }
}

/// Everything after the command verb
fn command_args(line: &str) -> &str {
    let line = line.trim();
    line.split_once(char::is_whitespace)
        .map(|(_, rest)| rest)
        .unwrap_or("")
}

/// PTR lookup bounded by `limit`; failures are logged and yield `None`
async fn reverse_lookup(
    resolver: &TokioAsyncResolver,
    ip: IpAddr,
    limit: Duration,
    cid: &str,
) -> Option<String> {
    match timeout(limit, resolver.reverse_lookup(ip)).await {
        Ok(Ok(lookup)) => lookup
            .iter()
            .next()
            .map(|name| name.to_string().trim_end_matches('.').to_string())
            .filter(|name| !name.is_empty()),
        Ok(Err(e)) => {
            error!(tnx = "connection", cid, host = %ip, "Reverse resolve for {}: {}", ip, e);
            None
        }
        Err(_) => {
            error!(tnx = "connection", cid, host = %ip, "Reverse resolve for {}: Timeout", ip);
            None
        }
    }
}
