mod common;

use common::{code, start_server, test_config, Client};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Accepts the server's throwaway certificate
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

async fn handshake(stream: TcpStream, name: &str) -> TlsStream<TcpStream> {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(name).unwrap();
    connector.connect(name, stream).await.unwrap()
}

#[tokio::test]
async fn test_starttls_upgrade() {
    let mut config = test_config();
    config.smtp.hide_starttls = false;
    let server = start_server(config).await;
    let mut client = server.greeted().await;

    let reply = client.expect("EHLO client.example.com", 250).await;
    assert!(reply.iter().any(|line| line.ends_with("STARTTLS")));

    let reply = client.expect("STARTTLS", 220).await;
    assert_eq!(reply[0], "220 Ready to start TLS");

    let tls = handshake(client.into_inner(), "mail.example.com").await;
    let mut client = Client::new(tls);

    // the upgraded session starts over and needs a fresh EHLO
    let reply = client.expect("MAIL FROM:<sender@example.com>", 503).await;
    assert_eq!(reply[0], "503 Error: send HELO/EHLO first");

    let reply = client.expect("EHLO client.example.com", 250).await;
    assert!(!reply.iter().any(|line| line.contains("STARTTLS")));

    let reply = client.expect("STARTTLS", 503).await;
    assert_eq!(reply[0], "503 Error: TLS already active");

    client.expect("MAIL FROM:<sender@example.com>", 250).await;
    client.expect("RCPT TO:<rcpt@example.com>", 250).await;
    client.expect("DATA", 354).await;
    client.write_raw(b"secret stuff\r\n.\r\n").await;
    assert_eq!(code(&client.read_reply().await), 250);

    assert_eq!(server.handler.messages()[0].body, b"secret stuff\r\n".to_vec());
}

#[tokio::test]
async fn test_starttls_discards_pipelined_plaintext() {
    let mut config = test_config();
    config.smtp.hide_starttls = false;
    let server = start_server(config).await;
    let mut client = server.greeted().await;
    client.expect("EHLO client.example.com", 250).await;

    client.write_raw(b"STARTTLS\r\nNOOP\r\n").await;
    let reply = client.read_reply().await;
    assert_eq!(reply, vec!["220 Ready to start TLS".to_string()]);

    let tls = handshake(client.into_inner(), "mail.example.com").await;
    let mut client = Client::new(tls);

    // the first encrypted reply answers RSET, the plaintext NOOP is gone
    let reply = client.command("RSET").await;
    assert_eq!(reply, vec!["250 Flushed".to_string()]);
    client.expect("QUIT", 221).await;
}

#[tokio::test]
async fn test_starttls_unavailable() {
    let mut config = test_config();
    config.smtp.hide_starttls = false;
    config.smtp.disabled_commands = vec!["STARTTLS".to_string()];
    let server = start_server(config).await;
    let mut client = server.greeted().await;

    client.expect("STARTTLS", 500).await;
}

#[tokio::test]
async fn test_implicit_tls() {
    let mut config = test_config();
    config.tls.secure = true;
    let server = start_server(config).await;

    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let tls = handshake(tcp, "mail.example.com").await;
    let mut client = Client::new(tls);

    let greeting = client.read_reply().await;
    assert_eq!(greeting, vec!["220 test.localhost ESMTP".to_string()]);

    let reply = client.expect("EHLO client.example.com", 250).await;
    assert!(!reply.iter().any(|line| line.contains("STARTTLS")));
    client.expect("STARTTLS", 503).await;
}

#[tokio::test]
async fn test_implicit_tls_in_connection() {
    let mut config = test_config();
    config.tls.secure = true;
    config.tls.needs_upgrade = true;
    let server = start_server(config).await;

    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let tls = handshake(tcp, "mail.example.com").await;
    let mut client = Client::new(tls);

    assert_eq!(code(&client.read_reply().await), 220);
    client.expect("NOOP", 250).await;
}

#[tokio::test]
async fn test_secured_upstream() {
    let mut config = test_config();
    config.tls.secured = true;
    config.smtp.hide_starttls = false;
    let server = start_server(config).await;
    let mut client = server.greeted().await;

    // already secure: no STARTTLS offered and AUTH needs no upgrade
    let reply = client.expect("EHLO client.example.com", 250).await;
    assert!(!reply.iter().any(|line| line.contains("STARTTLS")));
    client.expect("STARTTLS", 503).await;
}
