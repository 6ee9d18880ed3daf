//! SMTP command table and argument parsing
//!
//! Maps verbs to [`SmtpCommand`] and parses the `MAIL FROM` / `RCPT TO`
//! address syntax with its ESMTP parameters.

use crate::smtp::session::ParsedAddress;
use std::collections::BTreeMap;
use tracing::warn;

/// Command verbs understood by the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpCommand {
    Helo,
    Ehlo,
    Lhlo,
    Starttls,
    Auth,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Help,
    Xclient,
    Xforward,
    Wiz,
    Shell,
    Kill,
}

impl SmtpCommand {
    pub fn from_verb(verb: &str) -> Option<Self> {
        let command = match verb.to_ascii_uppercase().as_str() {
            "HELO" => SmtpCommand::Helo,
            "EHLO" => SmtpCommand::Ehlo,
            "LHLO" => SmtpCommand::Lhlo,
            "STARTTLS" => SmtpCommand::Starttls,
            "AUTH" => SmtpCommand::Auth,
            "MAIL" => SmtpCommand::Mail,
            "RCPT" => SmtpCommand::Rcpt,
            "DATA" => SmtpCommand::Data,
            "RSET" => SmtpCommand::Rset,
            "NOOP" => SmtpCommand::Noop,
            "QUIT" => SmtpCommand::Quit,
            "VRFY" => SmtpCommand::Vrfy,
            "HELP" => SmtpCommand::Help,
            "XCLIENT" => SmtpCommand::Xclient,
            "XFORWARD" => SmtpCommand::Xforward,
            "WIZ" => SmtpCommand::Wiz,
            "SHELL" => SmtpCommand::Shell,
            "KILL" => SmtpCommand::Kill,
            _ => return None,
        };
        Some(command)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SmtpCommand::Helo => "HELO",
            SmtpCommand::Ehlo => "EHLO",
            SmtpCommand::Lhlo => "LHLO",
            SmtpCommand::Starttls => "STARTTLS",
            SmtpCommand::Auth => "AUTH",
            SmtpCommand::Mail => "MAIL",
            SmtpCommand::Rcpt => "RCPT",
            SmtpCommand::Data => "DATA",
            SmtpCommand::Rset => "RSET",
            SmtpCommand::Noop => "NOOP",
            SmtpCommand::Quit => "QUIT",
            SmtpCommand::Vrfy => "VRFY",
            SmtpCommand::Help => "HELP",
            SmtpCommand::Xclient => "XCLIENT",
            SmtpCommand::Xforward => "XFORWARD",
            SmtpCommand::Wiz => "WIZ",
            SmtpCommand::Shell => "SHELL",
            SmtpCommand::Kill => "KILL",
        }
    }

    /// Commands refused with 503 until HELO/EHLO/LHLO was seen
    pub fn requires_greeting(&self) -> bool {
        matches!(
            self,
            SmtpCommand::Mail | SmtpCommand::Rcpt | SmtpCommand::Data | SmtpCommand::Auth
        )
    }

    /// Commands refused with 530 when authentication is mandatory
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            SmtpCommand::Mail | SmtpCommand::Rcpt | SmtpCommand::Data
        )
    }
}

/// Upper-cased first space-separated token of a command line
pub fn command_verb(line: &str) -> String {
    line.split(' ').next().unwrap_or("").to_ascii_uppercase()
}

/// Decode RFC 3461 xtext (`+HH` hex escapes, upper-case hex digits only)
pub fn decode_xtext(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'+'
            && i + 2 < bytes.len()
            && is_upper_hex(bytes[i + 1])
            && is_upper_hex(bytes[i + 2])
        {
            let hex = &value[i + 1..i + 3];
            if let Ok(code) = u8::from_str_radix(hex, 16) {
                out.push(char::from(code));
                i += 3;
                continue;
            }
        }

        // copy one full character
        let ch = value[i..].chars().next().unwrap_or('\u{fffd}');
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

fn is_upper_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'A'..=b'F').contains(&b)
}

/// Parse `MAIL FROM:<addr> PARAMS` or `RCPT TO:<addr> PARAMS`.
///
/// `name` is the expected prefix before the colon (`"MAIL FROM"` or
/// `"RCPT TO"`). Returns `None` when the line does not match the prefix,
/// the address is not framed in angle brackets, or a non-empty address
/// does not have exactly one `@` with both sides filled. The domain is
/// converted from punycode to Unicode; a conversion failure keeps the raw
/// domain.
pub fn parse_address_command(name: &str, line: &str) -> Option<ParsedAddress> {
    let (prefix, rest) = line.split_once(':').unwrap_or((line, ""));
    if !prefix.trim().eq_ignore_ascii_case(name.trim()) {
        return None;
    }

    let mut parts = rest.trim().split_whitespace();
    let framed = parts.next().unwrap_or("");

    let mut args = BTreeMap::new();
    for part in parts {
        let (key, value) = match part.split_once('=') {
            Some((key, value)) => (key, Some(decode_xtext(value))),
            None => (part, None),
        };
        args.insert(key.to_ascii_uppercase(), value);
    }

    let inner = framed.strip_prefix('<')?.strip_suffix('>')?;
    if inner.contains('<') || inner.contains('>') {
        return None;
    }

    let address = if inner.is_empty() {
        String::new()
    } else {
        let mut pieces = inner.split('@');
        let (local, domain) = match (pieces.next(), pieces.next(), pieces.next()) {
            (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => {
                (local, domain)
            }
            _ => return None,
        };
        format!("{}@{}", local, domain_to_unicode(domain))
    };

    Some(ParsedAddress { address, args })
}

fn domain_to_unicode(domain: &str) -> String {
    if !domain.to_ascii_lowercase().contains("xn--") {
        return domain.to_string();
    }

    let (unicode, result) = idna::domain_to_unicode(domain);
    match result {
        Ok(()) => unicode,
        Err(e) => {
            warn!(tnx = "punycode", "Failed to process punycode domain \"{}\": {:?}", domain, e);
            domain.to_string()
        }
    }
}
