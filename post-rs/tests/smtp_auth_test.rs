mod common;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{code, start_server, test_config, PASSWORD, USERNAME};
use hmac::{Hmac, Mac};
use md5::Md5;
use post_rs::config::Config;
use post_rs::smtp::ServerEvent;

fn auth_config() -> Config {
    let mut config = test_config();
    config.smtp.auth_optional = false;
    config.smtp.auth_methods = vec![
        "PLAIN".to_string(),
        "LOGIN".to_string(),
        "CRAM-MD5".to_string(),
        "XOAUTH2".to_string(),
    ];
    config
}

fn plain_token(username: &str, password: &str) -> String {
    STANDARD.encode(format!("\0{}\0{}", username, password))
}

#[tokio::test]
async fn test_auth_plain_inline() {
    let server = start_server(auth_config()).await;
    let mut client = server.greeted().await;
    client.expect("EHLO client.example.com", 250).await;

    let reply = client
        .expect(&format!("AUTH PLAIN {}", plain_token(USERNAME, PASSWORD)), 235)
        .await;
    assert_eq!(reply[0], "235 Authentication successful");

    // authenticated sessions no longer advertise AUTH
    let reply = client.expect("EHLO client.example.com", 250).await;
    assert!(!reply.iter().any(|line| line.contains("AUTH")));

    client.expect("MAIL FROM:<alice@example.com>", 250).await;
    client.expect("RCPT TO:<bob@example.com>", 250).await;
    client.expect("DATA", 354).await;
    client.write_raw(b"hi\r\n.\r\n").await;
    assert_eq!(code(&client.read_reply().await), 250);

    assert_eq!(server.handler.messages()[0].user.as_deref(), Some(USERNAME));
}

#[tokio::test]
async fn test_auth_plain_with_challenge() {
    let server = start_server(auth_config()).await;
    let mut client = server.greeted().await;
    client.expect("EHLO client.example.com", 250).await;

    let reply = client.expect("AUTH PLAIN", 334).await;
    assert_eq!(reply[0], "334 ");
    client.expect(&plain_token(USERNAME, PASSWORD), 235).await;
}

#[tokio::test]
async fn test_auth_login_round_trip() {
    let server = start_server(auth_config()).await;
    let mut client = server.greeted().await;
    client.expect("EHLO client.example.com", 250).await;

    let reply = client.expect("AUTH LOGIN", 334).await;
    assert_eq!(reply[0], "334 VXNlcm5hbWU6");
    let reply = client.expect(&STANDARD.encode(USERNAME), 334).await;
    assert_eq!(reply[0], "334 UGFzc3dvcmQ6");
    client.expect(&STANDARD.encode(PASSWORD), 235).await;

    let reply = client.expect("AUTH LOGIN", 503).await;
    assert_eq!(reply[0], "503 Error: No identity changes permitted");
}

#[tokio::test]
async fn test_auth_login_wrong_password() {
    let server = start_server(auth_config()).await;
    let mut client = server.greeted().await;
    client.expect("EHLO client.example.com", 250).await;

    client
        .expect(&format!("AUTH LOGIN {}", STANDARD.encode(USERNAME)), 334)
        .await;
    let reply = client.expect(&STANDARD.encode("nope"), 535).await;
    assert_eq!(reply[0], "535 Error: Authentication credentials invalid");

    client.expect("MAIL FROM:<alice@example.com>", 530).await;
}

#[tokio::test]
async fn test_auth_abort() {
    let server = start_server(auth_config()).await;
    let mut client = server.greeted().await;
    client.expect("EHLO client.example.com", 250).await;

    client.expect("AUTH LOGIN", 334).await;
    let reply = client.expect("*", 501).await;
    assert_eq!(reply[0], "501 Authentication aborted");

    // the continuation is gone, the next line is a command again
    client.expect("NOOP", 250).await;
}

#[tokio::test]
async fn test_auth_cram_md5() {
    let server = start_server(auth_config()).await;
    let mut client = server.greeted().await;
    client.expect("EHLO client.example.com", 250).await;

    let reply = client.expect("AUTH CRAM-MD5", 334).await;
    let challenge = STANDARD.decode(&reply[0][4..]).unwrap();
    let challenge = String::from_utf8(challenge).unwrap();
    assert!(challenge.starts_with('<'));
    assert!(challenge.ends_with("@test.localhost>"));

    let mut mac = Hmac::<Md5>::new_from_slice(PASSWORD.as_bytes()).unwrap();
    mac.update(challenge.as_bytes());
    let digest: String = mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    let answer = STANDARD.encode(format!("{} {}", USERNAME, digest));
    client.expect(&answer, 235).await;
}

#[tokio::test]
async fn test_auth_xoauth2() {
    let server = start_server(auth_config()).await;
    let mut client = server.greeted().await;
    client.expect("EHLO client.example.com", 250).await;

    let bad = STANDARD.encode("user=alice\x01auth=Bearer bad-token\x01\x01");
    let reply = client.expect(&format!("AUTH XOAUTH2 {}", bad), 334).await;
    let json = STANDARD.decode(&reply[0][4..]).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(json["status"], "401");

    let reply = client.expect("", 535).await;
    assert_eq!(reply[0], "535 Error: Username and Password not accepted");

    let good = STANDARD.encode("user=alice\x01auth=Bearer good-token\x01\x01");
    client.expect(&format!("AUTH XOAUTH2 {}", good), 235).await;
}

#[tokio::test]
async fn test_auth_unknown_or_disallowed_method() {
    let mut config = auth_config();
    config.smtp.auth_methods = vec!["PLAIN".to_string()];
    let server = start_server(config).await;
    let mut client = server.greeted().await;
    client.expect("EHLO client.example.com", 250).await;

    let reply = client.expect("AUTH LOGIN", 504).await;
    assert_eq!(reply[0], "504 Error: Unrecognized authentication type");
    client.expect("AUTH GSSAPI", 504).await;
    client.expect("AUTH XCLIENT alice", 504).await;
}

#[tokio::test]
async fn test_auth_requires_ehlo() {
    let server = start_server(auth_config()).await;
    let mut client = server.greeted().await;

    client.expect("AUTH PLAIN", 503).await;
}

#[tokio::test]
async fn test_auth_needs_starttls_when_available() {
    let mut config = auth_config();
    config.smtp.hide_starttls = false;
    let server = start_server(config).await;
    let mut client = server.greeted().await;

    let reply = client.expect("EHLO client.example.com", 250).await;
    assert!(reply.iter().any(|line| line.ends_with("STARTTLS")));

    let reply = client.expect("AUTH PLAIN", 538).await;
    assert_eq!(reply[0], "538 Error: Must issue a STARTTLS command first");
}

#[tokio::test]
async fn test_xclient_login_and_single_use() {
    let mut config = test_config();
    config.smtp.use_xclient = true;
    let server = start_server(config).await;
    let mut events = server.server.subscribe();
    let mut client = server.greeted().await;

    let reply = client.expect("EHLO proxy.example.com", 250).await;
    assert!(reply
        .iter()
        .any(|line| line.ends_with("XCLIENT NAME ADDR PORT PROTO HELO LOGIN")));

    let reply = client
        .expect(
            "XCLIENT ADDR=192.0.2.7 NAME=Client.Example.COM PORT=4242 LOGIN=carol",
            220,
        )
        .await;
    assert_eq!(reply[0], "220 test.localhost ESMTP");

    // the connect event waited for the forwarded address
    let info = loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let ServerEvent::Connect(info) = event {
            break info;
        }
    };
    assert_eq!(info.remote_address.to_string(), "192.0.2.7");
    assert_eq!(info.remote_port, 4242);
    assert_eq!(info.client_hostname, "client.example.com");

    let reply = client.expect("EHLO client.example.com", 250).await;
    assert!(reply[0].ends_with("Nice to meet you, client.example.com"));
    assert!(!reply.iter().any(|line| line.contains("XCLIENT")));

    let reply = client.expect("XCLIENT ADDR=192.0.2.8", 550).await;
    assert_eq!(reply[0], "550 Error: Not allowed");

    client.expect("MAIL FROM:<carol@example.com>", 250).await;
    client.expect("RCPT TO:<bob@example.com>", 250).await;
    client.expect("DATA", 354).await;
    client.write_raw(b"x\r\n.\r\n").await;
    assert_eq!(code(&client.read_reply().await), 250);
    assert_eq!(server.handler.messages()[0].user.as_deref(), Some("carol"));
}

#[tokio::test]
async fn test_xclient_errors() {
    let mut config = test_config();
    config.smtp.use_xclient = true;
    let server = start_server(config).await;
    let mut client = server.greeted().await;
    client.expect("EHLO proxy.example.com", 250).await;

    let reply = client.expect("XCLIENT ADDR=999.0.0.1", 501).await;
    assert_eq!(reply[0], "501 Error: Bad command parameter syntax. Invalid address");
    client.expect("XCLIENT FOO=bar", 501).await;

    client.expect("MAIL FROM:<a@example.com>", 250).await;
    client.expect("XCLIENT NAME=x", 503).await;
    client.expect("RSET", 250).await;

    let reply = client.expect("XCLIENT LOGIN=mallory", 550).await;
    assert_eq!(reply[0], "550 Unknown user mallory");
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn test_xclient_disabled() {
    let server = start_server(test_config()).await;
    let mut client = server.greeted().await;

    client.expect("XCLIENT ADDR=192.0.2.7", 550).await;
}

#[tokio::test]
async fn test_xforward_overrides() {
    let mut config = test_config();
    config.smtp.use_xforward = true;
    let server = start_server(config).await;
    let mut client = server.greeted().await;

    let reply = client.expect("EHLO relay.example.com", 250).await;
    assert!(reply
        .iter()
        .any(|line| line.ends_with("XFORWARD NAME ADDR PORT PROTO HELO IDENT SOURCE")));

    client
        .expect("XFORWARD NAME=origin.example.com ADDR=198.51.100.4 PROTO=ESMTP", 250)
        .await;
    client.expect("XFORWARD IDENT=abc SOURCE=REMOTE", 250).await;
    client.expect("XFORWARD LOGIN=abc", 501).await;
}
