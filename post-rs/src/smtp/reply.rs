//! SMTP reply formatting
//!
//! Replies are `<code>[-| ]<text>` lines: a hyphen continues a multi-line
//! reply, a space terminates it.

use std::fmt;

/// A complete (possibly multi-line) server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// Text of the reply without the trailing CRLF
    pub fn payload(&self) -> String {
        if self.lines.len() <= 1 {
            let text = self.lines.first().map(String::as_str).unwrap_or("");
            // RFC 4954: an empty 334 challenge still carries the separator
            return format!("{} {}", self.code, text);
        }

        let last = self.lines.len() - 1;
        self.lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let sep = if i < last { '-' } else { ' ' };
                format!("{}{}{}", self.code, sep, line)
            })
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    /// Wire form including the final CRLF
    pub fn to_wire(&self) -> String {
        format!("{}\r\n", self.payload())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        assert_eq!(Reply::new(250, "OK").to_wire(), "250 OK\r\n");
    }

    #[test]
    fn test_empty_challenge_keeps_space() {
        assert_eq!(Reply::new(334, "").to_wire(), "334 \r\n");
    }

    #[test]
    fn test_multiline() {
        let reply = Reply::multiline(
            250,
            vec![
                "mx.example.com Nice to meet you".to_string(),
                "PIPELINING".to_string(),
                "STARTTLS".to_string(),
            ],
        );
        assert_eq!(
            reply.to_wire(),
            "250-mx.example.com Nice to meet you\r\n250-PIPELINING\r\n250 STARTTLS\r\n"
        );
    }

    #[test]
    fn test_is_error() {
        assert!(Reply::new(421, "bye").is_error());
        assert!(!Reply::new(354, "go ahead").is_error());
    }
}
