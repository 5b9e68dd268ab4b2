//! IMAP-over-TLS mailbox gateway.
//!
//! A deliberately small client: connect, LOGIN, SELECT, and the UID commands
//! behind the four primitives. The protocol work is blocking and runs on
//! `spawn_blocking`; socket timeouts bound every read and write.

use std::io::{Read, Write as IoWrite};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::MailboxConfig;
use crate::error::GatewayError;
use crate::gateway::{MailboxGateway, MailboxSession};

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Longest response line we accept before giving up on the server.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Gateway that opens one IMAP connection per session.
pub struct ImapGateway {
    config: Arc<MailboxConfig>,
}

impl ImapGateway {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl MailboxGateway for ImapGateway {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, GatewayError> {
        let config = Arc::clone(&self.config);
        let conn = tokio::task::spawn_blocking(move || ImapConnection::connect(&config))
            .await
            .map_err(|e| GatewayError::Connect {
                reason: format!("connect task failed: {e}"),
            })??;

        info!(host = %self.config.host, "IMAP session opened");
        Ok(Box::new(ImapSession {
            conn: Arc::new(Mutex::new(conn)),
            trash_folder: self.config.trash_folder.clone(),
        }))
    }
}

/// One authenticated, inbox-selected IMAP connection.
struct ImapSession {
    conn: Arc<Mutex<ImapConnection>>,
    trash_folder: String,
}

impl ImapSession {
    /// Run a blocking protocol step on the connection.
    async fn run<F>(&self, op: &'static str, f: F) -> Result<(), GatewayError>
    where
        F: FnOnce(&mut ImapConnection) -> Result<(), GatewayError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| GatewayError::Protocol(format!("{op}: connection state poisoned")))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| GatewayError::Operation {
            op: op.to_string(),
            reason: format!("task failed: {e}"),
        })?
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn mark_read(&mut self, uid: u32) -> Result<(), GatewayError> {
        self.run("mark_read", move |c| c.add_flags(uid, "\\Seen", "mark_read"))
            .await
    }

    async fn move_to_folder(&mut self, uid: u32, folder: &str) -> Result<(), GatewayError> {
        let folder = folder.to_string();
        self.run("move_to_folder", move |c| c.move_to(uid, &folder, "move_to_folder"))
            .await
    }

    async fn add_flag(&mut self, uid: u32) -> Result<(), GatewayError> {
        self.run("add_flag", move |c| c.add_flags(uid, "\\Flagged", "add_flag"))
            .await
    }

    async fn delete(&mut self, uid: u32) -> Result<(), GatewayError> {
        let trash = self.trash_folder.clone();
        self.run("delete", move |c| c.move_to(uid, &trash, "delete"))
            .await
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.run("logout", |c| c.logout()).await
    }
}

// ── Protocol ────────────────────────────────────────────────────────

struct ImapConnection {
    tls: TlsStream,
    next_tag: u32,
    op_timeout: Duration,
}

impl ImapConnection {
    /// Connect, authenticate, and SELECT the configured inbox.
    ///
    /// Every failure here is a `GatewayError::Connect`.
    fn connect(config: &MailboxConfig) -> Result<Self, GatewayError> {
        let connect_err = |reason: String| GatewayError::Connect { reason };

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(format!("resolve {}: {e}", config.host)))?
            .next()
            .ok_or_else(|| connect_err(format!("no address for {}", config.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout)
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(config.operation_timeout))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_write_timeout(Some(config.operation_timeout))
            .map_err(|e| connect_err(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| connect_err(format!("TLS setup failed: {e}")))?
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| connect_err(format!("invalid server name: {e}")))?;
        let client = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(format!("TLS setup failed: {e}")))?;

        let mut conn = Self {
            tls: rustls::StreamOwned::new(client, tcp),
            next_tag: 1,
            op_timeout: config.operation_timeout,
        };

        let greeting = conn.read_line().map_err(|e| connect_err(e.to_string()))?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(connect_err(format!("unexpected greeting: {}", greeting.trim_end())));
        }

        let login = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        );
        // The command carries the password, so only the tagged status is reported
        let (status, _) = conn
            .command(&login)
            .map_err(|e| connect_err(e.to_string()))?;
        if !status.is_ok() {
            return Err(connect_err("login rejected".into()));
        }

        let (status, _) = conn
            .command(&format!("SELECT {}", quote(&config.inbox)))
            .map_err(|e| connect_err(e.to_string()))?;
        if !status.is_ok() {
            return Err(connect_err(format!("select {} failed: {}", config.inbox, status.text)));
        }

        debug!(inbox = %config.inbox, "IMAP inbox selected");
        Ok(conn)
    }

    /// Read one CRLF-terminated line.
    fn read_line(&mut self) -> std::io::Result<String> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "IMAP connection closed",
                    ));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                    if buf.len() > MAX_LINE_LEN {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "IMAP response line too long",
                        ));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a tagged command and collect responses up to the tagged status line.
    fn command(&mut self, cmd: &str) -> std::io::Result<(TaggedStatus, Vec<String>)> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.tls.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.tls.flush()?;

        let mut untagged = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(status) = TaggedStatus::parse(&tag, &line) {
                return Ok((status, untagged));
            }
            untagged.push(line);
        }
    }

    /// Run a command and require a tagged OK.
    fn expect_ok(&mut self, op: &str, cmd: &str) -> Result<(), GatewayError> {
        let timeout = self.op_timeout;
        let (status, _) = self
            .command(cmd)
            .map_err(|e| io_to_gateway(op, timeout, e))?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(GatewayError::Operation {
                op: op.to_string(),
                reason: status.text,
            })
        }
    }

    fn add_flags(&mut self, uid: u32, flag: &str, op: &str) -> Result<(), GatewayError> {
        self.expect_ok(op, &format!("UID STORE {uid} +FLAGS.SILENT ({flag})"))
    }

    /// Move via UID MOVE, falling back to COPY + \Deleted on servers
    /// without the MOVE extension. The source copy is left for the client
    /// to expunge.
    fn move_to(&mut self, uid: u32, folder: &str, op: &str) -> Result<(), GatewayError> {
        let mailbox = quote(folder);
        let timeout = self.op_timeout;

        // Folder may already exist; a NO here is expected
        let (status, _) = self
            .command(&format!("CREATE {mailbox}"))
            .map_err(|e| io_to_gateway(op, timeout, e))?;
        if status.is_ok() {
            info!(folder, "Created mailbox folder");
        }

        let (status, _) = self
            .command(&format!("UID MOVE {uid} {mailbox}"))
            .map_err(|e| io_to_gateway(op, timeout, e))?;
        if status.is_ok() {
            return Ok(());
        }

        warn!(folder, "UID MOVE refused, falling back to COPY");
        self.expect_ok(op, &format!("UID COPY {uid} {mailbox}"))?;
        self.expect_ok(op, &format!("UID STORE {uid} +FLAGS.SILENT (\\Deleted)"))
    }

    fn logout(&mut self) -> Result<(), GatewayError> {
        self.expect_ok("logout", "LOGOUT")
    }
}

/// The status word and trailing text of a tagged response.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TaggedStatus {
    word: String,
    text: String,
}

impl TaggedStatus {
    /// Parse `line` if it is the tagged response for `tag`.
    fn parse(tag: &str, line: &str) -> Option<Self> {
        let rest = line.strip_prefix(tag)?.strip_prefix(' ')?;
        let rest = rest.trim_end();
        let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
        Some(Self {
            word: word.to_ascii_uppercase(),
            text: text.to_string(),
        })
    }

    fn is_ok(&self) -> bool {
        self.word == "OK"
    }
}

/// Quote an IMAP string argument.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        // CR/LF would end the command line
        if c == '\r' || c == '\n' {
            continue;
        }
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn io_to_gateway(op: &str, timeout: Duration, e: std::io::Error) -> GatewayError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => GatewayError::Timeout {
            op: op.to_string(),
            timeout,
        },
        _ => GatewayError::Protocol(format!("{op}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config(port: u16) -> MailboxConfig {
        MailboxConfig {
            host: "127.0.0.1".into(),
            port,
            username: "user@example.com".into(),
            password: SecretString::from("pw".to_string()),
            inbox: "INBOX".into(),
            trash_folder: "Spam".into(),
            connect_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn quote_escapes_specials() {
        assert_eq!(quote("Archive"), "\"Archive\"");
        assert_eq!(quote("MailJaeger/Review"), "\"MailJaeger/Review\"");
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(quote("Inbox\r\nA9 LOGOUT"), "\"InboxA9 LOGOUT\"");
    }

    #[test]
    fn tagged_status_parsing() {
        let status = TaggedStatus::parse("A3", "A3 OK UID MOVE completed\r\n").unwrap();
        assert!(status.is_ok());
        assert_eq!(status.text, "UID MOVE completed");

        let status = TaggedStatus::parse("A3", "A3 NO [TRYCREATE] no such mailbox\r\n").unwrap();
        assert!(!status.is_ok());
        assert_eq!(status.text, "[TRYCREATE] no such mailbox");

        assert!(TaggedStatus::parse("A3", "* 1 EXISTS\r\n").is_none());
        // A31 is not A3
        assert!(TaggedStatus::parse("A3", "A31 OK done\r\n").is_none());
    }

    #[test]
    fn timeouts_map_to_timeout_errors() {
        let timeout = Duration::from_secs(30);
        let err = io_to_gateway("add_flag", timeout, std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert!(matches!(err, GatewayError::Timeout { timeout: t, .. } if t == timeout));
        let err = io_to_gateway("add_flag", timeout, std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_connect_error() {
        // Grab a free port, then close it so nothing is listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let gateway = ImapGateway::new(config(port));
        let result = gateway.open().await;
        assert!(matches!(result, Err(GatewayError::Connect { .. })));
    }

    #[tokio::test]
    async fn plaintext_server_fails_during_connect() {
        // A server that speaks plain IMAP instead of TLS
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let _ = stream.write_all(b"* OK plain IMAP ready\r\n");
                std::thread::sleep(Duration::from_millis(200));
            }
        });

        let gateway = ImapGateway::new(config(port));
        let result = gateway.open().await;
        assert!(matches!(result, Err(GatewayError::Connect { .. })));
    }
}
