//! XCLIENT / XFORWARD parameter parsing
//!
//! See http://www.postfix.org/XCLIENT_README.html and
//! http://www.postfix.org/XFORWARD_README.html. Both commands carry
//! `KEY=xtext` pairs from a fixed key list; the connection applies the
//! parsed result to its session.

use crate::smtp::commands::decode_xtext;
use crate::smtp::reply::Reply;
use std::net::IpAddr;

pub const XCLIENT_KEYS: &[&str] = &["NAME", "ADDR", "PORT", "PROTO", "HELO", "LOGIN"];
pub const XFORWARD_KEYS: &[&str] = &["NAME", "ADDR", "PORT", "PROTO", "HELO", "IDENT", "SOURCE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Xclient,
    Xforward,
}

impl Extension {
    fn allowed_keys(&self) -> &'static [&'static str] {
        match self {
            Extension::Xclient => XCLIENT_KEYS,
            Extension::Xforward => XFORWARD_KEYS,
        }
    }

    fn is_unavailable(&self, value: &str) -> bool {
        match self {
            Extension::Xclient => {
                value.eq_ignore_ascii_case("[UNAVAILABLE]")
                    || value.eq_ignore_ascii_case("[TEMPUNAVAIL]")
            }
            Extension::Xforward => value.eq_ignore_ascii_case("[UNAVAILABLE]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamError {
    Syntax,
    InvalidAddress,
}

impl ParamError {
    pub fn reply(&self) -> Reply {
        match self {
            ParamError::Syntax => Reply::new(501, "Error: Bad command parameter syntax"),
            ParamError::InvalidAddress => {
                Reply::new(501, "Error: Bad command parameter syntax. Invalid address")
            }
        }
    }
}

/// Validated parameters in the order the client sent them. Duplicate keys
/// keep their first value; unavailable markers become empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedParams {
    pub entries: Vec<(String, String)>,
}

impl ForwardedParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Non-empty ADDR value, already validated by [`parse`]
    pub fn addr(&self) -> Option<IpAddr> {
        self.get("ADDR")
            .filter(|value| !value.is_empty())
            .and_then(|value| value.parse().ok())
    }

    pub fn port(&self) -> Option<u16> {
        self.get("PORT").and_then(|value| value.parse().ok())
    }
}

/// Parse the arguments of an XCLIENT or XFORWARD command line (the verb
/// already stripped).
pub fn parse(extension: Extension, args: &str) -> Result<ForwardedParams, ParamError> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.is_empty() {
        return Err(ParamError::Syntax);
    }

    let mut params = ForwardedParams::default();

    for part in parts {
        let mut pieces = part.split('=');
        let key = pieces.next().unwrap_or("").to_ascii_uppercase();
        let value = match (pieces.next(), pieces.next()) {
            (Some(value), None) => value,
            _ => return Err(ParamError::Syntax),
        };
        if !extension.allowed_keys().contains(&key.as_str()) {
            return Err(ParamError::Syntax);
        }

        if params.has(&key) {
            continue;
        }

        let mut value = decode_xtext(value);
        if extension.is_unavailable(&value) {
            value.clear();
        }

        if key == "ADDR" && !value.is_empty() {
            value = normalize_addr(&value)?.to_string();
        }

        params.entries.push((key, value));
    }

    Ok(params)
}

/// Strip an `IPv6:` prefix and canonicalise the address
fn normalize_addr(value: &str) -> Result<IpAddr, ParamError> {
    let bare = match value.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("IPV6:") => &value[5..],
        _ => value,
    };
    bare.parse::<IpAddr>()
        .map_err(|_| ParamError::InvalidAddress)
}
