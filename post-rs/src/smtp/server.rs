//! Listener and admission layer
//!
//! Accepts sockets, reads an optional PROXY preamble, runs implicit TLS,
//! enforces `max_clients` and keeps a registry of live connections so that
//! [`SmtpServer::close`] can drain them.

use crate::config::Config;
use crate::error::{PostError, Result};
use crate::security::TlsConfig;
use crate::smtp::connection::{ConnectionOptions, SmtpConnection};
use crate::smtp::handler::MailHandler;
use crate::smtp::proxy;
use crate::smtp::reply::Reply;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pause after a failed accept, e.g. when the process is out of descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Connection details published when a client is announced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub id: String,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    pub host_name_appears_as: Option<String>,
    pub client_hostname: String,
}

/// Lifecycle notifications, see [`SmtpServer::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Listening(SocketAddr),
    Connect(ConnectInfo),
    Error { id: Option<String>, message: String },
    Close,
}

/// State shared by the listener and every connection
pub struct ServerContext {
    pub config: Config,
    /// Name used in greetings and CRAM-MD5 challenges
    pub name: String,
    pub handler: Arc<dyn MailHandler>,
    pub tls: Option<TlsConfig>,
    pub resolver: Option<TokioAsyncResolver>,
    events: broadcast::Sender<ServerEvent>,
}

impl ServerContext {
    pub fn new(config: Config, handler: Arc<dyn MailHandler>) -> Result<Self> {
        config.validate()?;
        let name = config.server_name();

        let tls = if needs_tls(&config) {
            Some(TlsConfig::from_settings(&config.tls, &name)?)
        } else {
            None
        };

        let resolver = if config.server.disable_reverse_lookup {
            None
        } else {
            Some(TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
                warn!("System resolver configuration unavailable ({}), using defaults", e);
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }))
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            name,
            handler,
            tls,
            resolver,
            events,
        })
    }

    /// Replace the TLS setup, e.g. with a store that has an SNI callback
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Publish an event; having no subscriber is fine
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

/// TLS is needed for implicit TLS and whenever STARTTLS can be offered
fn needs_tls(config: &Config) -> bool {
    if config.tls.secured {
        return false;
    }
    config.tls.secure || (!config.smtp.hide_starttls && !config.is_disabled("STARTTLS"))
}

struct ConnectionHandle {
    shutdown: CancellationToken,
}

type Registry = Arc<RwLock<HashMap<String, ConnectionHandle>>>;

pub struct SmtpServer {
    ctx: Arc<ServerContext>,
    connections: Registry,
    /// Stops the accept loop
    stop: CancellationToken,
}

impl SmtpServer {
    pub fn new(config: Config, handler: Arc<dyn MailHandler>) -> Result<Self> {
        Ok(Self::from_context(ServerContext::new(config, handler)?))
    }

    pub fn from_context(ctx: ServerContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            connections: Arc::new(RwLock::new(HashMap::new())),
            stop: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.ctx.subscribe()
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Bind to the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = &self.ctx.config.server.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        Ok(listener)
    }

    /// Bind and serve until [`close`](Self::close) is called
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.listen(listener).await
    }

    /// Serve on an already bound listener
    pub async fn listen(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            tnx = "listen",
            host = %local.ip(),
            port = local.port(),
            secure = self.ctx.config.tls.secure,
            "{}Server listening on {}",
            if self.ctx.config.tls.secure { "Secure " } else { "" },
            local
        );
        self.ctx.emit(ServerEvent::Listening(local));

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.stop.cancelled() => break,
            };

            match accepted {
                Ok((socket, peer)) => self.accept(socket, peer),
                Err(e) => {
                    error!(tnx = "listen", "Failed to accept connection: {}", e);
                    self.ctx.emit(ServerEvent::Error {
                        id: None,
                        message: e.to_string(),
                    });
                    tokio::select! {
                        _ = sleep(ACCEPT_ERROR_BACKOFF) => {}
                        _ = self.stop.cancelled() => break,
                    }
                }
            }
        }

        info!(tnx = "listen", "Server stopped accepting connections");
        Ok(())
    }

    fn accept(&self, socket: TcpStream, peer: SocketAddr) {
        let ctx = Arc::clone(&self.ctx);
        let connections = Arc::clone(&self.connections);

        tokio::spawn(async move {
            if let Err(e) = admit(socket, peer, ctx.clone(), connections).await {
                error!(tnx = "connection", host = %peer.ip(), "Failed to set up connection: {}", e);
                ctx.emit(ServerEvent::Error {
                    id: None,
                    message: e.to_string(),
                });
            }
        });
    }

    /// Stop accepting, wait up to `close_timeout_secs` for clients to
    /// leave, then tell the rest `421 Server shutting down`.
    pub async fn close(&self) {
        self.stop.cancel();

        let deadline = Instant::now() + self.ctx.config.close_timeout();
        let mut remaining = self.connection_count().await;
        while remaining > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
            remaining = self.connection_count().await;
        }

        if remaining > 0 {
            info!(
                tnx = "close",
                "Closing {} remaining connection{}",
                remaining,
                if remaining == 1 { "" } else { "s" }
            );
            for handle in self.connections.read().await.values() {
                handle.shutdown.cancel();
            }

            // give connections a moment to send their 421
            let grace = Instant::now() + Duration::from_secs(1);
            while self.connection_count().await > 0 && Instant::now() < grace {
                sleep(Duration::from_millis(20)).await;
            }
        }

        self.ctx.emit(ServerEvent::Close);
    }
}

/// Run one accepted socket through the admission steps and the connection.
///
/// The socket is registered first, so it counts against `max_clients` and
/// is drained by [`SmtpServer::close`] even while the PROXY header is read.
async fn admit(
    socket: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    connections: Registry,
) -> Result<()> {
    let id = connection_id();
    let shutdown = CancellationToken::new();

    let admitted = {
        let mut registry = connections.write().await;
        registry.insert(
            id.clone(),
            ConnectionHandle {
                shutdown: shutdown.clone(),
            },
        );
        ctx.config
            .server
            .max_clients
            .map_or(true, |max| registry.len() <= max)
    };

    let result = admit_registered(socket, peer, &id, admitted, ctx, shutdown).await;
    connections.write().await.remove(&id);
    result
}

async fn admit_registered(
    mut socket: TcpStream,
    peer: SocketAddr,
    id: &str,
    admitted: bool,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = socket.local_addr()?;
    let mut remote = peer;

    if proxy_allowed(&ctx.config.proxy.use_proxy, peer.ip()) {
        let header = tokio::select! {
            header = timeout(ctx.config.socket_timeout(), proxy::read_header(&mut socket)) => header,
            _ = shutdown.cancelled() => {
                debug!(tnx = "proxy", cid = %id, "Server closed while waiting for PROXY header");
                return Ok(());
            }
        };

        match header {
            Ok(Ok(header)) => {
                if let Some(addr) = header.remote_address {
                    remote = SocketAddr::new(addr, header.remote_port.unwrap_or(0));
                }
                info!(
                    tnx = "proxy",
                    cid = %id,
                    proxy = %peer.ip(),
                    "[{}] PROXY from {} through {} ({})",
                    id,
                    remote.ip(),
                    peer.ip(),
                    header.protocol
                );
            }
            Ok(Err(e)) => {
                warn!(tnx = "proxy", cid = %id, host = %peer.ip(), "{}", e);
                let _ = socket.write_all(b"* BAD Invalid PROXY header\r\n").await;
                let _ = socket.shutdown().await;
                return Ok(());
            }
            Err(_) => {
                warn!(tnx = "proxy", cid = %id, host = %peer.ip(), "Timed out waiting for PROXY header");
                let _ = socket.shutdown().await;
                return Ok(());
            }
        }
    }

    if !admitted {
        debug!(tnx = "connection", cid = %id, "Too many connected clients");
        let reply = Reply::new(
            421,
            format!("{} Too many connected clients, try again in a moment", ctx.name),
        );
        let _ = socket.write_all(reply.to_wire().as_bytes()).await;
        let _ = socket.shutdown().await;
        return Ok(());
    }

    let ignore = ctx
        .config
        .proxy
        .ignored_hosts
        .iter()
        .any(|host| host.parse::<IpAddr>().map_or(false, |ip| ip == remote.ip()));

    let options = ConnectionOptions {
        id: id.to_string(),
        local_addr: local,
        remote_addr: remote,
        ignore,
    };

    serve_connection(socket, options, ctx, shutdown).await
}

async fn serve_connection(
    socket: TcpStream,
    options: ConnectionOptions,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    let tls = &ctx.config.tls;
    let listener_handshake = tls.secure && !tls.needs_upgrade && !tls.secured;

    if !listener_handshake {
        SmtpConnection::new(socket, options, ctx, shutdown).run().await;
        return Ok(());
    }

    let acceptor = ctx
        .tls
        .as_ref()
        .map(|tls| tls.acceptor())
        .ok_or_else(|| PostError::Tls("implicit TLS requested but no TLS configuration".to_string()))?;

    let handshake = tokio::select! {
        handshake = timeout(ctx.config.socket_timeout(), acceptor.accept(socket)) => handshake,
        _ = shutdown.cancelled() => return Ok(()),
    };

    let stream = match handshake {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            // scanners and plain-text clients on a TLS port end up here
            debug!(
                tnx = "connection",
                cid = %options.id,
                host = %options.remote_addr.ip(),
                "TLS handshake failed: {}",
                e
            );
            return Ok(());
        }
        Err(_) => {
            debug!(tnx = "connection", cid = %options.id, "TLS handshake timed out");
            return Ok(());
        }
    };

    SmtpConnection::with_tls(stream, options, ctx, shutdown)
        .run()
        .await;
    Ok(())
}

fn proxy_allowed(allowed: &[String], peer: IpAddr) -> bool {
    allowed.iter().any(|entry| {
        entry == "*" || entry.parse::<IpAddr>().map_or(false, |ip| ip == peer)
    })
}

/// Random connection id: 10 bytes, base64, lower-cased
pub fn connection_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes).to_lowercase()
}
