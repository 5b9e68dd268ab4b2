//! Configuration types.
//!
//! Everything is read once at startup from `MAILWARDEN_*` environment
//! variables and then passed around as immutable structs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

const PREFIX: &str = "MAILWARDEN_";

/// Policy applied by the preview/apply pipeline.
#[derive(Debug, Clone)]
pub struct ApplyPolicy {
    /// Global safety switch. When on, no mailbox mutation is ever attempted.
    pub safe_mode: bool,
    /// Opt-in required before DELETE actions may execute.
    pub allow_destructive: bool,
    /// The only folders a MOVE_FOLDER action may target.
    pub safe_folders: Vec<String>,
    /// Upper bound on actions per preview/apply call.
    pub max_apply_per_request: usize,
    /// How long an apply token stays valid after preview.
    pub token_ttl: Duration,
    /// Include (redacted) error messages instead of bare error kinds.
    pub verbose_errors: bool,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        let folders = FolderNames::default();
        Self {
            safe_mode: true,
            allow_destructive: false,
            safe_folders: folders.safe_folders(),
            max_apply_per_request: 20,
            token_ttl: Duration::from_secs(300), // 5 minutes
            verbose_errors: false,
        }
    }
}

impl ApplyPolicy {
    /// Whether `folder` is on the move allowlist.
    pub fn is_safe_folder(&self, folder: &str) -> bool {
        self.safe_folders.iter().any(|f| f == folder)
    }
}

/// Well-known folder names shared by proposals and the allowlist.
#[derive(Debug, Clone)]
pub struct FolderNames {
    pub spam: String,
    pub quarantine: String,
    pub archive: String,
    pub review: String,
}

impl Default for FolderNames {
    fn default() -> Self {
        Self {
            spam: "Spam".into(),
            quarantine: "Quarantine".into(),
            archive: "Archive".into(),
            review: "MailJaeger/Review".into(),
        }
    }
}

impl FolderNames {
    /// Deduplicated, non-empty allowlist built from the configured folders.
    pub fn safe_folders(&self) -> Vec<String> {
        let mut folders: Vec<String> = Vec::new();
        for f in [&self.spam, &self.quarantine, &self.archive, &self.review] {
            let f = f.trim();
            if !f.is_empty() && !folders.iter().any(|existing| existing == f) {
                folders.push(f.to_string());
            }
        }
        folders
    }
}

/// How classifier output is turned into proposed actions.
#[derive(Debug, Clone)]
pub struct ProposalConfig {
    pub spam_threshold: f32,
    pub mark_as_read: bool,
    pub delete_spam: bool,
    pub quarantine_folder: String,
    pub archive_folder: String,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        let folders = FolderNames::default();
        Self {
            spam_threshold: 0.7,
            mark_as_read: false,
            delete_spam: false,
            quarantine_folder: folders.quarantine,
            archive_folder: folders.archive,
        }
    }
}

/// IMAP connection settings for the mailbox gateway.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub inbox: String,
    /// Where `delete` moves messages to.
    pub trash_folder: String,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl MailboxConfig {
    /// Live credential values the leak detector must scrub.
    pub fn credentials(&self) -> Vec<SecretString> {
        vec![
            SecretString::from(self.username.clone()),
            self.password.clone(),
        ]
    }
}

/// HTTP server and process-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

/// Everything the binary needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub policy: ApplyPolicy,
    pub proposals: ProposalConfig,
    /// `None` when no IMAP host is configured; applies then report the
    /// mailbox as unavailable.
    pub mailbox: Option<MailboxConfig>,
}

impl AppConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let folders = FolderNames {
            spam: vars.string("SPAM_FOLDER", "Spam"),
            quarantine: vars.string("QUARANTINE_FOLDER", "Quarantine"),
            archive: vars.string("ARCHIVE_FOLDER", "Archive"),
            review: vars.string("REVIEW_FOLDER", "MailJaeger/Review"),
        };

        let server = ServerConfig {
            bind: vars.parse("BIND", SocketAddr::from(([127, 0, 0, 1], 8000)))?,
            db_path: PathBuf::from(vars.string("DB_PATH", "./data/mailwarden.db")),
            log_level: vars.string("LOG_LEVEL", "info"),
            log_file: vars.get("LOG_FILE").map(PathBuf::from),
        };

        let policy = ApplyPolicy {
            safe_mode: vars.flag("SAFE_MODE", true)?,
            allow_destructive: vars.flag("ALLOW_DESTRUCTIVE_IMAP", false)?,
            safe_folders: folders.safe_folders(),
            max_apply_per_request: vars.parse("MAX_APPLY_PER_REQUEST", 20usize)?,
            token_ttl: Duration::from_secs(vars.parse("APPLY_TOKEN_TTL_SECS", 300u64)?),
            verbose_errors: vars.flag("VERBOSE_ERRORS", false)?,
        };

        let proposals = ProposalConfig {
            spam_threshold: vars.parse("SPAM_THRESHOLD", 0.7f32)?,
            mark_as_read: vars.flag("MARK_AS_READ", false)?,
            delete_spam: vars.flag("DELETE_SPAM", false)?,
            quarantine_folder: folders.quarantine.clone(),
            archive_folder: folders.archive.clone(),
        };

        let mailbox = match vars.get("IMAP_HOST") {
            Some(host) => Some(MailboxConfig {
                host,
                port: vars.parse("IMAP_PORT", 993u16)?,
                username: vars.string("IMAP_USERNAME", ""),
                password: SecretString::from(vars.string("IMAP_PASSWORD", "")),
                inbox: vars.string("IMAP_INBOX", "INBOX"),
                trash_folder: folders.spam.clone(),
                connect_timeout: Duration::from_secs(vars.parse("IMAP_CONNECT_TIMEOUT_SECS", 15u64)?),
                operation_timeout: Duration::from_secs(
                    vars.parse("IMAP_OPERATION_TIMEOUT_SECS", 30u64)?,
                ),
            }),
            None => None,
        };

        let config = Self {
            server,
            policy,
            proposals,
            mailbox,
        };
        config.validate()?;
        Ok(config)
    }

    /// Fail-closed checks that span several settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.verbose_errors && !self.server.bind.ip().is_loopback() {
            return Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}VERBOSE_ERRORS"),
                message: format!(
                    "verbose errors are not allowed when listening on {}",
                    self.server.bind
                ),
            });
        }
        if self.policy.max_apply_per_request == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}MAX_APPLY_PER_REQUEST"),
                message: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.proposals.spam_threshold) {
            return Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}SPAM_THRESHOLD"),
                message: "must be between 0.0 and 1.0".into(),
            });
        }
        if let Some(mailbox) = &self.mailbox {
            if mailbox.username.is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("{PREFIX}IMAP_USERNAME"),
                    hint: format!("Required when {PREFIX}IMAP_HOST is set."),
                });
            }
        }
        Ok(())
    }
}

/// Prefixed variable access with typed parsing.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{name}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: format!("{PREFIX}{name}"),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(ConfigError::InvalidValue {
                    key: format!("{PREFIX}{name}"),
                    message: format!("expected a boolean, got '{other}'"),
                }),
            },
        }
    }
}
