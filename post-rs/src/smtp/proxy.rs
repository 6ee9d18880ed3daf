//! PROXY protocol v1 preamble
//!
//! Load balancers prepend `PROXY TCP4 <src> <dst> <srcport> <dstport>\r\n`
//! to the stream. The header is read one byte at a time so that nothing
//! after the LF is consumed before the SMTP parser takes over.

use crate::error::{PostError, Result};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest v1 header allowed, CRLF included
const MAX_HEADER_LEN: usize = 107;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    /// `TCP4`, `TCP6` or `UNKNOWN`
    pub protocol: String,
    pub remote_address: Option<IpAddr>,
    pub local_address: Option<IpAddr>,
    pub remote_port: Option<u16>,
    pub local_port: Option<u16>,
}

/// Read and parse one PROXY v1 line from `reader`
pub async fn read_header<R>(reader: &mut R) -> Result<ProxyHeader>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_HEADER_LEN);

    loop {
        let byte = reader.read_u8().await?;
        line.push(byte);
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_HEADER_LEN {
            return Err(PostError::ProxyHeader("header too long".to_string()));
        }
    }

    parse_header(&String::from_utf8_lossy(&line))
}

pub fn parse_header(line: &str) -> Result<ProxyHeader> {
    let params: Vec<&str> = line.trim().split(' ').collect();
    if params.first() != Some(&"PROXY") {
        return Err(PostError::ProxyHeader(format!("unexpected preamble {:?}", line.trim())));
    }

    let protocol = params.get(1).copied().unwrap_or("UNKNOWN").to_string();

    Ok(ProxyHeader {
        protocol,
        remote_address: parse_ip(params.get(2))?,
        local_address: parse_ip(params.get(3))?,
        remote_port: parse_port(params.get(4))?,
        local_port: parse_port(params.get(5))?,
    })
}

fn parse_ip(value: Option<&&str>) -> Result<Option<IpAddr>> {
    match value.map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(value) => value
            .to_ascii_lowercase()
            .parse()
            .map(Some)
            .map_err(|_| PostError::ProxyHeader(format!("invalid address {:?}", value))),
        None => Ok(None),
    }
}

fn parse_port(value: Option<&&str>) -> Result<Option<u16>> {
    match value.map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| PostError::ProxyHeader(format!("invalid port {:?}", value))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_read_header_leaves_remainder() {
        let input: &[u8] = b"PROXY TCP4 192.0.2.10 198.51.100.1 56324 25\r\nEHLO x\r\n";
        let mut reader = input;

        let header = read_header(&mut reader).await.unwrap();
        assert_eq!(header.protocol, "TCP4");
        assert_eq!(header.remote_address, Some("192.0.2.10".parse().unwrap()));
        assert_eq!(header.local_address, Some("198.51.100.1".parse().unwrap()));
        assert_eq!(header.remote_port, Some(56324));
        assert_eq!(header.local_port, Some(25));

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "EHLO x\r\n");
    }

    #[test]
    fn test_tcp6_and_unknown() {
        let header = parse_header("PROXY TCP6 2001:DB8::1 2001:db8::2 4000 25").unwrap();
        assert_eq!(header.remote_address, Some("2001:db8::1".parse().unwrap()));

        let header = parse_header("PROXY UNKNOWN").unwrap();
        assert_eq!(header.protocol, "UNKNOWN");
        assert_eq!(header.remote_address, None);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            parse_header("EHLO example.com"),
            Err(PostError::ProxyHeader(_))
        ));
        assert!(parse_header("PROXY TCP4 bogus 1.2.3.4 1 2").is_err());
    }

    #[tokio::test]
    async fn test_eof_before_newline() {
        let mut reader: &[u8] = b"PROXY TCP4";
        assert!(matches!(read_header(&mut reader).await, Err(PostError::Io(_))));
    }

    #[tokio::test]
    async fn test_overlong_header() {
        let long = format!("PROXY {}\r\n", "A".repeat(200));
        let mut reader = long.as_bytes();
        assert!(matches!(
            read_header(&mut reader).await,
            Err(PostError::ProxyHeader(_))
        ));
    }
}
