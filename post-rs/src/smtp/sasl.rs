//! SASL mechanisms for the AUTH command
//!
//! Each mechanism is a set of pure transitions: [`start`] handles the
//! `AUTH <mechanism> [initial-response]` line, [`resume`] handles every
//! continuation line, and [`conclude`] turns the backend answer into the
//! final reply. Nothing here touches the socket; the connection sends the
//! replies, stores the returned [`SaslState`] as its pending continuation
//! and calls the backend when asked to with [`SaslStep::Verify`].

use crate::error::Rejection;
use crate::smtp::handler::{AuthRequest, AuthResponse, Credentials};
use crate::smtp::reply::Reply;
use crate::smtp::session::User;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use rand::Rng;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    Plain,
    Login,
    CramMd5,
    Xoauth2,
    /// Internal passthrough used by `XCLIENT LOGIN=`, never advertised
    Xclient,
}

impl AuthMethod {
    /// Mechanisms selectable through `AUTH`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            "XOAUTH2" => Some(AuthMethod::Xoauth2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
            AuthMethod::Xoauth2 => "XOAUTH2",
            AuthMethod::Xclient => "XCLIENT",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a mechanism is waiting for the next client line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslState {
    PlainToken,
    LoginUsername,
    LoginPassword { username: String },
    Xoauth2Token,
    /// XOAUTH2 error challenge was sent; the client must acknowledge it
    Xoauth2Error,
    CramMd5Token { challenge: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Final reply, the exchange is over
    Reply(Reply),
    /// Send the challenge and feed the next line to [`resume`]
    Challenge(Reply, SaslState),
    /// Credentials are complete; ask the backend
    Verify(AuthRequest),
}

/// What the backend decided
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Authenticated(User),
    /// The backend answered but did not return a user
    Failed(Reply),
    /// The backend returned an error
    Rejected(Reply),
    /// XOAUTH2 error challenge, wait for the acknowledgement line
    Challenge(Reply, SaslState),
}

pub fn start(method: AuthMethod, args: &[&str], server_name: &str) -> SaslStep {
    match method {
        AuthMethod::Plain => {
            if args.len() > 1 {
                return SaslStep::Reply(Reply::new(501, "Error: syntax: AUTH PLAIN token"));
            }
            match args.first() {
                Some(token) => plain_token(token),
                None => SaslStep::Challenge(Reply::new(334, ""), SaslState::PlainToken),
            }
        }
        AuthMethod::Login => {
            if args.len() > 1 {
                return SaslStep::Reply(Reply::new(501, "Error: syntax: AUTH LOGIN"));
            }
            match args.first() {
                Some(username) => login_username(username),
                None => SaslStep::Challenge(Reply::new(334, "VXNlcm5hbWU6"), SaslState::LoginUsername),
            }
        }
        AuthMethod::Xoauth2 => {
            if args.len() > 1 {
                return SaslStep::Reply(Reply::new(501, "Error: syntax: AUTH XOAUTH2 token"));
            }
            match args.first() {
                Some(token) => xoauth2_token(token),
                None => SaslStep::Challenge(Reply::new(334, ""), SaslState::Xoauth2Token),
            }
        }
        AuthMethod::CramMd5 => {
            if !args.is_empty() {
                return SaslStep::Reply(Reply::new(501, "Error: syntax: AUTH CRAM-MD5"));
            }
            let challenge = cram_md5_challenge(server_name);
            SaslStep::Challenge(
                Reply::new(334, STANDARD.encode(&challenge)),
                SaslState::CramMd5Token { challenge },
            )
        }
        AuthMethod::Xclient => SaslStep::Verify(xclient_request(args.first().copied().unwrap_or(""))),
    }
}

/// Feed one continuation line to the waiting mechanism
pub fn resume(state: SaslState, line: &str) -> SaslStep {
    let line = line.trim();
    if line == "*" {
        return SaslStep::Reply(Reply::new(501, "Authentication aborted"));
    }

    match state {
        SaslState::PlainToken => plain_token(line),
        SaslState::LoginUsername => login_username(line),
        SaslState::LoginPassword { username } => SaslStep::Verify(AuthRequest {
            method: AuthMethod::Login,
            username,
            credentials: Credentials::Password(decode(line)),
        }),
        SaslState::Xoauth2Token => xoauth2_token(line),
        SaslState::Xoauth2Error => {
            SaslStep::Reply(Reply::new(535, "Error: Username and Password not accepted"))
        }
        SaslState::CramMd5Token { challenge } => {
            let decoded = decode(line);
            let mut parts = decoded.split(' ');
            let username = parts.next().unwrap_or("").to_string();
            let response = parts.next().unwrap_or("").to_ascii_lowercase();
            SaslStep::Verify(AuthRequest {
                method: AuthMethod::CramMd5,
                username,
                credentials: Credentials::CramMd5 {
                    challenge,
                    response,
                },
            })
        }
    }
}

/// Map the backend answer for an AUTH exchange to the reply to send
pub fn conclude(request: &AuthRequest, result: Result<AuthResponse, Rejection>) -> AuthOutcome {
    match result {
        Err(rejection) => AuthOutcome::Rejected(Reply::new(rejection.code_or(535), rejection.message)),
        Ok(AuthResponse {
            user: Some(user), ..
        }) => AuthOutcome::Authenticated(user),
        Ok(response) if request.method == AuthMethod::Xoauth2 => {
            let data = response.data.unwrap_or_else(|| serde_json::json!({}));
            let payload = STANDARD.encode(data.to_string());
            AuthOutcome::Challenge(
                Reply::new(response.code.unwrap_or(334), payload),
                SaslState::Xoauth2Error,
            )
        }
        Ok(response) => AuthOutcome::Failed(Reply::new(
            response.code.unwrap_or(535),
            response
                .message
                .unwrap_or_else(|| "Error: Authentication credentials invalid".to_string()),
        )),
    }
}

/// Backend request for the `XCLIENT LOGIN=` passthrough
pub fn xclient_request(username: &str) -> AuthRequest {
    AuthRequest {
        method: AuthMethod::Xclient,
        username: username.trim().to_string(),
        credentials: Credentials::None,
    }
}

/// Map the backend answer for an XCLIENT login to a user or an error text
pub fn conclude_xclient(result: Result<AuthResponse, Rejection>) -> Result<User, String> {
    match result {
        Err(rejection) => Err(rejection.message),
        Ok(AuthResponse {
            user: Some(user), ..
        }) => Ok(user),
        Ok(_) => Err("Authentication credentials invalid".to_string()),
    }
}

fn plain_token(token: &str) -> SaslStep {
    let decoded = decode(token.trim());
    let fields: Vec<&str> = decoded.split('\0').collect();
    if fields.len() != 3 {
        return SaslStep::Reply(Reply::new(500, "Error: invalid userdata"));
    }

    // authzid falls back to authcid
    let username = if fields[1].is_empty() { fields[0] } else { fields[1] };

    SaslStep::Verify(AuthRequest {
        method: AuthMethod::Plain,
        username: username.to_string(),
        credentials: Credentials::Password(fields[2].to_string()),
    })
}

fn login_username(token: &str) -> SaslStep {
    let username = decode(token.trim());
    if username.is_empty() {
        return SaslStep::Reply(Reply::new(500, "Error: missing username"));
    }

    SaslStep::Challenge(
        Reply::new(334, "UGFzc3dvcmQ6"),
        SaslState::LoginPassword { username },
    )
}

fn xoauth2_token(token: &str) -> SaslStep {
    let decoded = decode(token.trim());
    let mut username = String::new();
    let mut access_token = String::new();

    for part in decoded.split('\x01') {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        let value = value.trim();

        if key.eq_ignore_ascii_case("user") {
            username = value.to_string();
        } else if key.eq_ignore_ascii_case("auth") {
            let mut words = value.split_whitespace();
            if words
                .next()
                .map_or(false, |scheme| scheme.eq_ignore_ascii_case("bearer"))
            {
                access_token = words.collect::<Vec<_>>().join(" ");
            }
        }
    }

    if username.is_empty() || access_token.is_empty() {
        return SaslStep::Reply(Reply::new(500, "Error: invalid userdata"));
    }

    SaslStep::Verify(AuthRequest {
        method: AuthMethod::Xoauth2,
        username,
        credentials: Credentials::AccessToken(access_token),
    })
}

/// `<{8 random digits}{unix seconds}@{server name}>`
fn cram_md5_challenge(server_name: &str) -> String {
    let random: u32 = rand::thread_rng().gen_range(10_000_000..100_000_000);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("<{}{}@{}>", random, now, server_name)
}

/// Lenient base64 decoding; garbage decodes to an empty string
fn decode(value: &str) -> String {
    STANDARD
        .decode(value)
        .or_else(|_| STANDARD_NO_PAD.decode(value))
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
