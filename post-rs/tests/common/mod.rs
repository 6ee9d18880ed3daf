//! Shared helpers for the integration tests: a recording handler, a server
//! bound to an ephemeral port and a line-oriented SMTP client.

#![allow(dead_code)]

use async_trait::async_trait;
use post_rs::config::Config;
use post_rs::error::Rejection;
use post_rs::smtp::handler::default_auth_response;
use post_rs::smtp::{
    AuthMethod, AuthRequest, AuthResponse, DataOutcome, IncomingMessage, MailHandler,
    ParsedAddress, Session, SmtpServer, User,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "secret";

#[derive(Debug, Clone)]
pub struct Received {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub body: Vec<u8>,
    pub size_exceeded: bool,
    pub user: Option<String>,
}

/// Accepts `alice`/`secret`, rejects `unknown@` recipients and, in LMTP
/// mode, answers per recipient with `full@` mailboxes over quota. A
/// `slow@` sender keeps `on_mail_from` busy for half a minute.
#[derive(Default)]
pub struct RecordingHandler {
    pub messages: Mutex<Vec<Received>>,
    pub closed: AtomicUsize,
    pub chunks: AtomicUsize,
}

impl RecordingHandler {
    pub fn messages(&self) -> Vec<Received> {
        self.messages.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Body chunks seen by `on_data` so far
    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailHandler for RecordingHandler {
    async fn on_auth(
        &self,
        request: &AuthRequest,
        _session: &Session,
    ) -> Result<AuthResponse, Rejection> {
        match request.method {
            AuthMethod::Xclient if request.username == "mallory" => {
                Err(Rejection::new("Unknown user mallory"))
            }
            AuthMethod::Xclient => Ok(AuthResponse::accept(User::new(request.username.clone()))),
            AuthMethod::Xoauth2 if request.access_token() == Some("good-token") => {
                Ok(AuthResponse::accept(User::new(request.username.clone())))
            }
            AuthMethod::Xoauth2 => Ok(default_auth_response(request)),
            _ if request.username == USERNAME && request.validate_password(PASSWORD) => {
                Ok(AuthResponse::accept(User::new(USERNAME)))
            }
            _ => Ok(AuthResponse::deny("Error: Authentication credentials invalid")),
        }
    }

    async fn on_mail_from(
        &self,
        address: &ParsedAddress,
        _session: &Session,
    ) -> Result<(), Rejection> {
        if address.address.starts_with("slow@") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(())
    }

    async fn on_rcpt_to(&self, address: &ParsedAddress, _session: &Session) -> Result<(), Rejection> {
        if address.address.starts_with("unknown@") {
            return Err(Rejection::new("Error: Unknown user"));
        }
        Ok(())
    }

    async fn on_data(
        &self,
        mut message: IncomingMessage,
        session: &Session,
    ) -> Result<DataOutcome, Rejection> {
        let mut body = Vec::new();
        while let Some(chunk) = message.next_chunk().await {
            self.chunks.fetch_add(1, Ordering::SeqCst);
            body.extend_from_slice(&chunk);
        }

        let envelope = &session.envelope;
        self.messages.lock().unwrap().push(Received {
            mail_from: envelope
                .mail_from
                .as_ref()
                .map(|from| from.address.clone())
                .unwrap_or_default(),
            rcpt_to: envelope.rcpt_to.iter().map(|rcpt| rcpt.address.clone()).collect(),
            body,
            size_exceeded: message.size_exceeded(),
            user: session.username().map(str::to_string),
        });

        if message.size_exceeded() {
            return Err(Rejection::with_code(552, "Error: message exceeds size limit"));
        }

        if session.transmission_type.lmtp {
            let replies = envelope
                .rcpt_to
                .iter()
                .map(|rcpt| {
                    if rcpt.address.starts_with("full@") {
                        Err(Rejection::with_code(452, "Mailbox full"))
                    } else {
                        Ok(None)
                    }
                })
                .collect();
            return Ok(DataOutcome::PerRecipient(replies));
        }

        Ok(DataOutcome::Accepted(None))
    }

    async fn on_close(&self, _session: &Session) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Plain SMTP on loopback with optional auth and no reverse lookups
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.name = Some("test.localhost".to_string());
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.server.disable_reverse_lookup = true;
    config.smtp.hide_starttls = true;
    config.smtp.auth_optional = true;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<SmtpServer>,
    pub handler: Arc<RecordingHandler>,
}

impl TestServer {
    pub async fn connect(&self) -> Client<TcpStream> {
        Client::connect(self.addr).await
    }

    /// Connect and consume the 220 greeting
    pub async fn greeted(&self) -> Client<TcpStream> {
        let mut client = self.connect().await;
        let greeting = client.read_reply().await;
        assert_eq!(code(&greeting), 220, "unexpected greeting {:?}", greeting);
        client
    }
}

pub async fn start_server(config: Config) -> TestServer {
    let handler = Arc::new(RecordingHandler::default());
    let server = Arc::new(SmtpServer::new(config, handler.clone()).unwrap());

    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.listen(listener).await });

    TestServer {
        addr,
        server,
        handler,
    }
}

/// Reply code of a parsed reply
pub fn code(reply: &[String]) -> u16 {
    reply
        .last()
        .and_then(|line| line.get(..3))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

pub struct Client<S> {
    stream: BufReader<S>,
}

impl Client<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.unwrap())
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        let stream = self.stream.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    pub async fn send(&mut self, line: &str) {
        self.write_raw(format!("{}\r\n", line).as_bytes()).await;
    }

    /// Next line without CRLF; empty string on EOF
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.stream.read_line(&mut line))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// All lines of the next (possibly multi-line) reply
    pub async fn read_reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            if line.is_empty() {
                return lines;
            }
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if last {
                return lines;
            }
        }
    }

    pub async fn command(&mut self, line: &str) -> Vec<String> {
        self.send(line).await;
        self.read_reply().await
    }

    /// Send a command and assert the reply code
    pub async fn expect(&mut self, line: &str, expected: u16) -> Vec<String> {
        let reply = self.command(line).await;
        assert_eq!(code(&reply), expected, "{} -> {:?}", line, reply);
        reply
    }

    /// True once the server has closed the connection
    pub async fn is_closed(&mut self) -> bool {
        self.read_line().await.is_empty()
    }
}
