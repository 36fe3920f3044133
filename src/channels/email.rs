//! Mail channel: payload goes out as an attachment, results come back in the inbox.
//!
//! Outbound subjects carry a `[TAG:{job_id}]` token. Each probe is one inbox
//! scan: every unread message with the token and a result attachment
//! resolves its job, so a single scan can complete many jobs at once.

use std::sync::Arc;

use async_trait::async_trait;
use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::channels::{Channel, ChannelKind, Completion};
use crate::config::{EnvLookup, parse_or, process_env, require};
use crate::error::{ChannelError, ConfigError};
use crate::store::JobId;

// ── Configuration ───────────────────────────────────────────────────

/// Email channel configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    /// Mailbox of the agent that processes payloads.
    pub to_address: String,
    pub poll_interval_secs: u64,
    /// Tag name used in subjects, as in `[VCF_UPLOAD:{id}]`.
    pub subject_tag: String,
    /// File name given to the outbound attachment.
    pub attachment_name: String,
    /// Inbound attachments whose names end with this are results.
    pub result_suffix: String,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (channel disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Option<Self>, ConfigError> {
        let Some(imap_host) = lookup("EMAIL_IMAP_HOST") else {
            return Ok(None);
        };

        let smtp_host =
            lookup("EMAIL_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let username = lookup("EMAIL_USERNAME").unwrap_or_default();
        let password = lookup("EMAIL_PASSWORD").unwrap_or_default();
        let from_address = lookup("EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone());
        let to_address = require(
            lookup,
            "EMAIL_TO_ADDRESS",
            "Set it to the mailbox of the agent that processes uploads.",
        )?;

        let poll_interval_secs = parse_or(lookup, "EMAIL_POLL_INTERVAL_SECS", 10_u64)?;
        if poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EMAIL_POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        Ok(Some(Self {
            imap_port: parse_or(lookup, "EMAIL_IMAP_PORT", 993)?,
            smtp_port: parse_or(lookup, "EMAIL_SMTP_PORT", 587)?,
            imap_host,
            smtp_host,
            username,
            password,
            from_address,
            to_address,
            poll_interval_secs,
            subject_tag: lookup("EMAIL_SUBJECT_TAG").unwrap_or_else(|| "VCF_UPLOAD".into()),
            attachment_name: lookup("EMAIL_ATTACHMENT_NAME")
                .unwrap_or_else(|| "user_upload.vcf".into()),
            result_suffix: lookup("EMAIL_RESULT_SUFFIX").unwrap_or_else(|| ".txt".into()),
        }))
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// A message to send to the agent.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub attachment: Vec<u8>,
}

/// An unread message as stored on the server.
#[derive(Debug, Clone)]
pub struct InboundMail {
    /// Server-side handle used to mark the message consumed.
    pub uid: String,
    /// Full RFC 822 source.
    pub raw: Vec<u8>,
}

/// Mail transport: send to the agent, read the relay's own inbox.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<(), ChannelError>;

    /// Fetch unread messages whose subject contains `subject_hint`.
    /// Must not mark anything as read.
    async fn fetch_unseen(&self, subject_hint: &str) -> Result<Vec<InboundMail>, ChannelError>;

    /// Mark messages as read so later scans skip them.
    async fn mark_seen(&self, uids: &[String]) -> Result<(), ChannelError>;
}

/// What an inbound message turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// No job tag in the subject; not ours.
    Unrelated,
    /// Tagged, but no attachment matching the result suffix.
    MissingResult { job_id: JobId },
    /// Tagged with a result attachment.
    Result { job_id: JobId, contents: Vec<u8> },
}

// ── Channel ─────────────────────────────────────────────────────────

/// Mail channel: SMTP out, inbox scan in.
pub struct MailChannel {
    mailbox: Arc<dyn Mailbox>,
    tag: String,
    tag_pattern: Regex,
    attachment_name: String,
    result_suffix: String,
}

impl MailChannel {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        tag: &str,
        attachment_name: &str,
        result_suffix: &str,
    ) -> Result<Self, ConfigError> {
        let tag = tag.trim();
        if tag.is_empty() || tag.contains([']', '[', ':']) {
            return Err(ConfigError::InvalidValue {
                key: "EMAIL_SUBJECT_TAG".into(),
                message: format!("{tag:?} cannot be used inside a [TAG:id] token"),
            });
        }

        let tag_pattern = Regex::new(&format!(r"\[{}:\s*([^\]\s]+)\s*\]", regex::escape(tag)))
            .map_err(|e| ConfigError::InvalidValue {
                key: "EMAIL_SUBJECT_TAG".into(),
                message: e.to_string(),
            })?;

        Ok(Self {
            mailbox,
            tag: tag.to_string(),
            tag_pattern,
            attachment_name: attachment_name.to_string(),
            result_suffix: result_suffix.to_ascii_lowercase(),
        })
    }

    /// Build the channel from config over the given transport.
    pub fn from_config(config: &EmailConfig, mailbox: Arc<dyn Mailbox>) -> Result<Self, ConfigError> {
        Self::new(
            mailbox,
            &config.subject_tag,
            &config.attachment_name,
            &config.result_suffix,
        )
    }

    /// Subject line carrying the job tag.
    pub fn subject_for(&self, id: &JobId) -> String {
        format!("[{}:{id}]", self.tag)
    }

    /// Pull the job id out of a subject, if it carries our tag.
    pub fn job_id_from_subject(&self, subject: &str) -> Option<JobId> {
        self.tag_pattern
            .captures(subject)
            .and_then(|caps| caps.get(1))
            .map(|m| JobId::from(m.as_str()))
    }

    /// Classify one raw inbound message.
    pub fn read_inbound(&self, raw: &[u8]) -> Inbound {
        let Some(parsed) = MessageParser::default().parse(raw) else {
            return Inbound::Unrelated;
        };

        let Some(job_id) = parsed.subject().and_then(|s| self.job_id_from_subject(s)) else {
            return Inbound::Unrelated;
        };

        let result = parsed.attachments().find(|part| {
            MimeHeaders::attachment_name(*part)
                .is_some_and(|name| name.to_ascii_lowercase().ends_with(&self.result_suffix))
        });

        match result {
            Some(part) => Inbound::Result {
                job_id,
                contents: part.contents().to_vec(),
            },
            None => Inbound::MissingResult { job_id },
        }
    }
}

#[async_trait]
impl Channel for MailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Mail
    }

    async fn dispatch(&self, id: &JobId, payload: &[u8]) -> Result<(), ChannelError> {
        let subject = self.subject_for(id);
        self.mailbox
            .send(OutgoingMail {
                subject: subject.clone(),
                body: "VCF file attached.".into(),
                attachment_name: self.attachment_name.clone(),
                attachment: payload.to_vec(),
            })
            .await
            .map_err(|e| match e {
                ChannelError::DispatchFailed { .. } => e,
                other => ChannelError::DispatchFailed {
                    name: "mail".into(),
                    reason: other.to_string(),
                },
            })?;

        info!(job_id = %id, subject = %subject, "Sent payload by email");
        Ok(())
    }

    /// One inbox scan. Tagged messages are consumed (marked read) whether or
    /// not they carried a result; unrelated mail is left unread.
    async fn probe(&self, _pending: &[JobId]) -> Result<Vec<Completion>, ChannelError> {
        let hint = format!("[{}:", self.tag);
        let messages = self.mailbox.fetch_unseen(&hint).await?;
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = messages.len(), "Scanning unread messages");

        let mut completions = Vec::new();
        let mut consumed = Vec::new();

        for mail in messages {
            match self.read_inbound(&mail.raw) {
                Inbound::Unrelated => {
                    debug!(uid = %mail.uid, "Ignoring untagged message");
                }
                Inbound::MissingResult { job_id } => {
                    warn!(
                        job_id = %job_id,
                        suffix = %self.result_suffix,
                        "Tagged message has no result attachment"
                    );
                    consumed.push(mail.uid);
                }
                Inbound::Result { job_id, contents } => {
                    debug!(job_id = %job_id, bytes = contents.len(), "Found result attachment");
                    completions.push(Completion::new(job_id, contents));
                    consumed.push(mail.uid);
                }
            }
        }

        // Resolution is idempotent, so a failed mark only costs a re-scan.
        if !consumed.is_empty()
            && let Err(e) = self.mailbox.mark_seen(&consumed).await
        {
            warn!(error = %e, "Failed to mark messages as seen");
        }

        Ok(completions)
    }
}
