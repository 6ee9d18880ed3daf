//! Per-connection session state handed to every handler callback
//!
//! [`Session`] is a snapshot of what the connection knows about its client:
//! addresses, the announced hostname, TLS parameters, the authenticated
//! user and the current [`Envelope`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Authenticated user as returned by the application's auth backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub username: String,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// Address from `MAIL FROM` / `RCPT TO` plus its ESMTP parameters.
///
/// Parameter keys are upper-cased. A bare flag such as `SMTPUTF8` is
/// stored as `None`, while `KEY=` keeps an empty value `Some("")`, so the
/// two stay distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ParsedAddress {
    pub address: String,
    pub args: BTreeMap<String, Option<String>>,
}

impl ParsedAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: BTreeMap::new(),
        }
    }

    /// Value of `KEY=value`; `None` for bare flags and missing keys
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .get(&key.to_ascii_uppercase())
            .and_then(|value| value.as_deref())
    }

    /// True when the parameter was given at all, with or without a value
    pub fn has_arg(&self, key: &str) -> bool {
        self.args.contains_key(&key.to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub mail_from: Option<ParsedAddress>,
    pub rcpt_to: Vec<ParsedAddress>,
}

impl Envelope {
    /// Add a recipient; an address already present (compared after
    /// Unicode lower-casing) is replaced in place instead of duplicated.
    pub fn add_recipient(&mut self, recipient: ParsedAddress) {
        let key = recipient.address.to_lowercase();
        match self
            .rcpt_to
            .iter_mut()
            .find(|existing| existing.address.to_lowercase() == key)
        {
            Some(existing) => *existing = recipient,
            None => self.rcpt_to.push(recipient),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.mail_from.is_some()
    }
}

/// Negotiated protocol flavour, rendered as e.g. `ESMTPSA` or `LMTP`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransmissionType {
    pub lmtp: bool,
    pub extended: bool,
    pub secure: bool,
    pub authenticated: bool,
}

impl fmt::Display for TransmissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            f.write_str("E")?;
        }
        f.write_str(if self.lmtp { "LMTP" } else { "SMTP" })?;
        if self.secure {
            f.write_str("S")?;
        }
        if self.authenticated {
            f.write_str("A")?;
        }
        Ok(())
    }
}

/// Negotiated TLS parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TlsInfo {
    pub protocol: Option<String>,
    pub cipher: Option<String>,
    pub servername: Option<String>,
}

/// Per-connection protocol state handed to every [`MailHandler`] callback.
///
/// Created once per accepted socket. HELO/EHLO, RSET and the end of a DATA
/// transaction replace the envelope but keep the authenticated user.
///
/// [`MailHandler`]: crate::smtp::MailHandler
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub secure: bool,
    pub servername: Option<String>,
    pub tls: Option<TlsInfo>,
    pub transmission_type: TransmissionType,
    pub user: Option<User>,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    /// Reverse-resolved name or `[ip]`
    pub client_hostname: String,
    /// Hostname the client gave in HELO/EHLO/LHLO
    pub host_name_appears_as: Option<String>,
    pub opening_command: Option<String>,
    pub envelope: Envelope,
    /// Number of the current transaction, starting at 1
    pub transaction: u64,
    pub xclient: BTreeMap<String, String>,
    pub xforward: BTreeMap<String, String>,
    /// Last reply with a 4xx/5xx code
    pub error: Option<String>,
    pub is_wizard: bool,
    /// Connection comes from an ignored host (health checks, load balancers)
    pub ignore: bool,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secure: false,
            servername: None,
            tls: None,
            transmission_type: TransmissionType::default(),
            user: None,
            local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 0,
            remote_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_port: 0,
            client_hostname: String::new(),
            host_name_appears_as: None,
            opening_command: None,
            envelope: Envelope::default(),
            transaction: 1,
            xclient: BTreeMap::new(),
            xforward: BTreeMap::new(),
            error: None,
            is_wizard: false,
            ignore: false,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.username.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmission_type_display() {
        let mut kind = TransmissionType::default();
        assert_eq!(kind.to_string(), "SMTP");

        kind.extended = true;
        kind.secure = true;
        kind.authenticated = true;
        assert_eq!(kind.to_string(), "ESMTPSA");

        let lmtp = TransmissionType {
            lmtp: true,
            extended: true,
            ..Default::default()
        };
        assert_eq!(lmtp.to_string(), "ELMTP");
    }

    #[test]
    fn test_duplicate_recipient_replaced() {
        let mut envelope = Envelope::default();
        envelope.add_recipient(ParsedAddress::new("bob@example.com"));
        envelope.add_recipient(ParsedAddress::new("carol@example.com"));

        let mut again = ParsedAddress::new("BOB@example.com");
        again.args.insert("NOTIFY".to_string(), Some("NEVER".to_string()));
        envelope.add_recipient(again);

        assert_eq!(envelope.rcpt_to.len(), 2);
        assert_eq!(envelope.rcpt_to[0].address, "BOB@example.com");
        assert_eq!(envelope.rcpt_to[0].arg("notify"), Some("NEVER"));
    }

    #[test]
    fn test_duplicate_unicode_recipient_replaced() {
        let mut envelope = Envelope::default();
        envelope.add_recipient(ParsedAddress::new("jörg@münchen.de"));
        envelope.add_recipient(ParsedAddress::new("JÖRG@MÜNCHEN.DE"));

        assert_eq!(envelope.rcpt_to.len(), 1);
        assert_eq!(envelope.rcpt_to[0].address, "JÖRG@MÜNCHEN.DE");
    }

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new("abc");
        assert_eq!(session.transaction, 1);
        assert!(!session.is_authenticated());
        assert!(!session.envelope.in_transaction());
    }
}
