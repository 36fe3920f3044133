//! Real mail transport: SMTP via lettre for outbound, raw IMAP over rustls for inbound.
//!
//! Both sides are blocking and run on `spawn_blocking`. IMAP uses UIDs so
//! the fetch session and the later `\Seen` session agree on which message
//! is which.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{debug, info};

use crate::channels::email::{EmailConfig, InboundMail, Mailbox, OutgoingMail};
use crate::error::ChannelError;

/// Socket read/write timeout for IMAP.
const IMAP_TIMEOUT: Duration = Duration::from_secs(30);

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Mailbox backed by an SMTP relay and an IMAP inbox.
pub struct ImapSmtpMailbox {
    config: EmailConfig,
}

impl ImapSmtpMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailbox for ImapSmtpMailbox {
    async fn send(&self, mail: OutgoingMail) -> Result<(), ChannelError> {
        let cfg = self.config.clone();
        tokio::task::spawn_blocking(move || send_smtp(&cfg, mail))
            .await
            .map_err(|e| ChannelError::DispatchFailed {
                name: "mail".into(),
                reason: format!("SMTP task panicked: {e}"),
            })?
    }

    async fn fetch_unseen(&self, subject_hint: &str) -> Result<Vec<InboundMail>, ChannelError> {
        let cfg = self.config.clone();
        let hint = subject_hint.to_string();
        tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg, &hint))
            .await
            .map_err(|e| probe_failed(format!("IMAP fetch task panicked: {e}")))?
    }

    async fn mark_seen(&self, uids: &[String]) -> Result<(), ChannelError> {
        let cfg = self.config.clone();
        let uids = uids.to_vec();
        tokio::task::spawn_blocking(move || mark_seen_imap(&cfg, &uids))
            .await
            .map_err(|e| probe_failed(format!("IMAP mark-seen task panicked: {e}")))?
    }
}

fn probe_failed(reason: impl Into<String>) -> ChannelError {
    ChannelError::ProbeFailed {
        name: "mail".into(),
        reason: reason.into(),
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

fn dispatch_failed(reason: impl Into<String>) -> ChannelError {
    ChannelError::DispatchFailed {
        name: "mail".into(),
        reason: reason.into(),
    }
}

/// Send one message via SMTP (blocking; run in spawn_blocking).
fn send_smtp(config: &EmailConfig, mail: OutgoingMail) -> Result<(), ChannelError> {
    let creds = Credentials::new(config.username.clone(), config.password.clone());

    // 465 is implicit TLS; anything else negotiates STARTTLS.
    let builder = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    };
    let builder = builder.map_err(|e| dispatch_failed(format!("SMTP relay error: {e}")))?;

    let transport = builder
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let attachment_type = ContentType::parse("application/octet-stream")
        .map_err(|e| dispatch_failed(format!("Invalid attachment content type: {e}")))?;

    let email = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| dispatch_failed(format!("Invalid from address: {e}")))?,
        )
        .to(config
            .to_address
            .parse()
            .map_err(|e| dispatch_failed(format!("Invalid to address: {e}")))?)
        .subject(mail.subject.as_str())
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(mail.body))
                .singlepart(Attachment::new(mail.attachment_name).body(mail.attachment, attachment_type)),
        )
        .map_err(|e| dispatch_failed(format!("Failed to build email: {e}")))?;

    transport
        .send(&email)
        .map_err(|e| dispatch_failed(format!("SMTP send failed: {e}")))?;

    info!(to = %config.to_address, subject = %mail.subject, "Email sent");
    Ok(())
}

// ── IMAP ────────────────────────────────────────────────────────────

/// Response to one tagged IMAP command.
#[derive(Debug, Default)]
struct ImapResponse {
    /// Text lines, literals stripped.
    lines: Vec<String>,
    /// `{n}` literal payloads in the order they arrived.
    literals: Vec<Vec<u8>>,
}

/// A logged-in IMAP session with INBOX selected.
struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapSession {
    fn open(config: &EmailConfig) -> Result<Self, ChannelError> {
        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))?;
        tcp.set_read_timeout(Some(IMAP_TIMEOUT))?;
        tcp.set_write_timeout(Some(IMAP_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| probe_failed(format!("Invalid IMAP host name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| probe_failed(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };

        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(ChannelError::InvalidResponse {
                name: "imap".into(),
                reason: format!("unexpected greeting: {}", greeting.trim_end()),
            });
        }

        let login = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(&config.password)
        );
        match session.command(&login) {
            Ok(_) => {}
            Err(ChannelError::InvalidResponse { reason, .. }) => {
                return Err(ChannelError::AuthFailed {
                    name: "imap".into(),
                    reason,
                });
            }
            Err(e) => return Err(e),
        }

        session.command("SELECT \"INBOX\"")?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(ChannelError::InvalidResponse {
                name: "imap".into(),
                reason: "connection closed".into(),
            });
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send a command and collect everything up to its tagged completion.
    /// Anything other than a tagged `OK` is an error.
    fn command(&mut self, cmd: &str) -> Result<ImapResponse, ChannelError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let mut response = ImapResponse::default();
        loop {
            let line = self.read_line()?;

            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal)?;
                response.literals.push(literal);
            }

            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                let verb = cmd.split_whitespace().next().unwrap_or_default();
                return Err(ChannelError::InvalidResponse {
                    name: "imap".into(),
                    reason: format!("{verb} failed: {}", status.trim_end()),
                });
            }

            response.lines.push(line);
        }
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Byte count of a `{n}` literal announced at the end of a response line.
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// UIDs from `* SEARCH` lines.
fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter(|uid| uid.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// Fetch unread messages whose subject contains `subject_hint`, without
/// setting `\Seen` (blocking; run in spawn_blocking).
fn fetch_unseen_imap(
    config: &EmailConfig,
    subject_hint: &str,
) -> Result<Vec<InboundMail>, ChannelError> {
    let mut session = ImapSession::open(config)?;

    let search = session.command(&format!("UID SEARCH UNSEEN SUBJECT {}", quote(subject_hint)))?;
    let uids = parse_search(&search.lines);

    let mut messages = Vec::with_capacity(uids.len());
    for uid in uids {
        let fetched = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        match fetched.literals.into_iter().next() {
            Some(raw) => messages.push(InboundMail { uid, raw }),
            None => debug!(uid = %uid, "FETCH returned no message body"),
        }
    }

    session.logout();
    Ok(messages)
}

/// Set `\Seen` on the given UIDs (blocking; run in spawn_blocking).
fn mark_seen_imap(config: &EmailConfig, uids: &[String]) -> Result<(), ChannelError> {
    if uids.is_empty() {
        return Ok(());
    }

    let mut session = ImapSession::open(config)?;
    session.command(&format!("UID STORE {} +FLAGS (\\Seen)", uids.join(",")))?;
    session.logout();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_len_detects_announcement() {
        assert_eq!(literal_len("* 1 FETCH (UID 7 BODY[] {342}\r\n"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (UID 7 BODY[] {12+}\r\n"), Some(12));
        assert_eq!(literal_len("A3 OK FETCH completed\r\n"), None);
        assert_eq!(literal_len(")\r\n"), None);
        assert_eq!(literal_len("* OK {not a number}\r\n"), None);
    }

    #[test]
    fn quote_escapes_specials() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
        assert_eq!(quote("[VCF_UPLOAD:"), "\"[VCF_UPLOAD:\"");
    }

    #[test]
    fn parse_search_collects_uids() {
        let lines = vec![
            "* SEARCH 4 9 12\r\n".to_string(),
            "* 3 EXISTS\r\n".to_string(),
        ];
        assert_eq!(parse_search(&lines), vec!["4", "9", "12"]);
    }

    #[test]
    fn parse_search_empty_result() {
        let lines = vec!["* SEARCH\r\n".to_string()];
        assert!(parse_search(&lines).is_empty());
    }
}
