//! Error sanitization: the one place that decides what error text may be
//! persisted, logged, or returned to a client.
//!
//! Production mode exposes only the error kind. Verbose mode exposes the
//! message after the `LeakDetector` has scrubbed credential-shaped content.

use std::fmt::Display;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ErrorKind;

/// Longest error message we ever store or return.
const MAX_MESSAGE_LEN: usize = 500;

const REDACTED: &str = "[REDACTED]";

/// A single redaction rule with a compiled regex.
#[derive(Debug, Clone)]
struct RedactionRule {
    regex: Regex,
    replacement: &'static str,
}

/// Scrubs credential-shaped substrings and known live secrets from text.
pub struct LeakDetector {
    rules: Vec<RedactionRule>,
    secrets: Vec<SecretString>,
}

impl LeakDetector {
    /// Create a leak detector with the fixed pattern table and no live secrets.
    pub fn new() -> Self {
        let rules = vec![
            // IMAP LOGIN arguments, quoted or bare
            RedactionRule {
                regex: Regex::new(r#"(?i)\bLOGIN\s+("[^"]*"|\S+)\s+("[^"]*"|\S+)"#).unwrap(),
                replacement: "LOGIN [REDACTED] [REDACTED]",
            },
            // Bearer tokens
            RedactionRule {
                regex: Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").unwrap(),
                replacement: "Bearer [REDACTED]",
            },
            // key=value / key: value credentials
            RedactionRule {
                regex: Regex::new(
                    r#"(?i)\b(password|passwd|pwd|user|username|login|api[_-]?key|token|secret|authorization)(["']?\s*[=:]\s*)("[^"]*"|'[^']*'|\S+)"#,
                )
                .unwrap(),
                replacement: "${1}${2}[REDACTED]",
            },
        ];

        Self {
            rules,
            secrets: Vec::new(),
        }
    }

    /// Also redact these exact values (configured passwords, usernames).
    pub fn with_secrets(mut self, secrets: impl IntoIterator<Item = SecretString>) -> Self {
        self.secrets.extend(
            secrets
                .into_iter()
                .filter(|s| !s.expose_secret().trim().is_empty()),
        );
        self
    }

    /// Scrub sensitive data from `content`.
    pub fn scrub(&self, content: &str) -> String {
        let mut out = content.to_string();
        // Literal secrets first, so a pattern rewrite can't split one.
        for secret in &self.secrets {
            out = out.replace(secret.expose_secret(), REDACTED);
        }
        for rule in &self.rules {
            out = rule.regex.replace_all(&out, rule.replacement).into_owned();
        }
        out
    }
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides what any caller-visible or persisted error string may contain.
pub struct ErrorSanitizer {
    verbose: bool,
    detector: LeakDetector,
}

impl ErrorSanitizer {
    pub fn new(verbose: bool, detector: LeakDetector) -> Self {
        Self { verbose, detector }
    }

    /// Production sanitizer: kinds only.
    pub fn production() -> Self {
        Self::new(false, LeakDetector::new())
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Render an error for storage or an API response.
    pub fn sanitize<E>(&self, error: &E) -> String
    where
        E: ErrorKind + Display + ?Sized,
    {
        if self.verbose {
            self.scrub_message(&error.to_string())
        } else {
            error.kind().to_string()
        }
    }

    /// Scrub and truncate free-form text. Used for verbose output and logs.
    pub fn scrub_message(&self, message: &str) -> String {
        truncate(&self.detector.scrub(message), MAX_MESSAGE_LEN)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DatabaseError, GatewayError};

    fn verbose_with(secrets: &[&str]) -> ErrorSanitizer {
        let detector = LeakDetector::new()
            .with_secrets(secrets.iter().map(|s| SecretString::from(s.to_string())));
        ErrorSanitizer::new(true, detector)
    }

    #[test]
    fn production_returns_kind_only() {
        let sanitizer = ErrorSanitizer::production();
        let err = GatewayError::Operation {
            op: "move".into(),
            reason: "NO [AUTHENTICATIONFAILED] password=hunter2".into(),
        };
        assert_eq!(sanitizer.sanitize(&err), "MailboxOperationError");

        let err = GatewayError::Connect {
            reason: "connection refused".into(),
        };
        assert_eq!(sanitizer.sanitize(&err), "ConnectionError");

        let err = DatabaseError::Query("SELECT secret".into());
        assert_eq!(sanitizer.sanitize(&err), "DatabaseError");
    }

    #[test]
    fn verbose_redacts_key_value_credentials() {
        let sanitizer = verbose_with(&[]);
        let out = sanitizer.scrub_message("login failed: user=alice password=hunter2 api_key: abc123");
        assert!(!out.contains("alice"));
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("abc123"));
        assert!(out.contains("password=[REDACTED]"));
    }

    #[test]
    fn verbose_redacts_bearer_tokens() {
        let sanitizer = verbose_with(&[]);
        let out = sanitizer.scrub_message("upstream said: Authorization Bearer eyJhbGciOi.xyz");
        assert!(!out.contains("eyJhbGciOi"));
        assert!(out.contains("Bearer [REDACTED]"));
    }

    #[test]
    fn verbose_redacts_imap_login_command() {
        let sanitizer = verbose_with(&[]);
        let out = sanitizer.scrub_message(r#"A1 LOGIN "me@example.com" "s3cret" failed"#);
        assert!(!out.contains("me@example.com"));
        assert!(!out.contains("s3cret"));
    }

    #[test]
    fn verbose_redacts_live_secrets() {
        let sanitizer = verbose_with(&["correct-horse-battery", ""]);
        let err = GatewayError::Protocol("server echoed correct-horse-battery back".into());
        let out = sanitizer.sanitize(&err);
        assert!(!out.contains("correct-horse-battery"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn verbose_redacts_mailbox_username() {
        let sanitizer = verbose_with(&["mailbox-owner@example.com", "hunter2"]);
        let err = GatewayError::Connect {
            reason: "no account mailbox-owner@example.com on this server".into(),
        };
        let out = sanitizer.sanitize(&err);
        assert!(!out.contains("mailbox-owner@example.com"), "{out}");
    }

    #[test]
    fn verbose_keeps_harmless_text() {
        let sanitizer = verbose_with(&[]);
        let err = GatewayError::Operation {
            op: "move".into(),
            reason: "folder does not exist".into(),
        };
        assert_eq!(sanitizer.sanitize(&err), "Mailbox move failed: folder does not exist");
    }

    #[test]
    fn long_messages_are_truncated() {
        let sanitizer = verbose_with(&[]);
        let out = sanitizer.scrub_message(&"é".repeat(600));
        assert!(out.len() <= MAX_MESSAGE_LEN + 3);
        assert!(out.ends_with("..."));
    }
}
