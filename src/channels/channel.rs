//! Channel trait: hand a payload to an out-of-band agent, later pick up its result.

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::store::JobId;

/// The kinds of channel a submission can be routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Shared remote folder (local directory or Google Drive).
    #[serde(alias = "drive")]
    Folder,
    /// Outbound SMTP, inbound IMAP.
    #[serde(alias = "email")]
    Mail,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Folder => "folder",
            Self::Mail => "mail",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "folder" | "drive" => Ok(Self::Folder),
            "mail" | "email" => Ok(Self::Mail),
            other => Err(format!("unknown channel '{other}' (expected folder or mail)")),
        }
    }
}

/// A result found for a job during a probe cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub job_id: JobId,
    pub result: Vec<u8>,
}

impl Completion {
    pub fn new(job_id: JobId, result: impl Into<Vec<u8>>) -> Self {
        Self {
            job_id,
            result: result.into(),
        }
    }
}

/// A delivery channel to an out-of-band agent.
///
/// `probe` takes every job currently waiting on this channel and returns
/// whatever completions it can see in one pass. Per-job channels look each
/// id up; batch channels (an inbox scan) may return results for any subset.
/// A returned `Err` means the whole cycle failed and is retried next tick.
#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Send `payload` for job `id`. Must not return `Ok` unless the payload
    /// actually left the process.
    async fn dispatch(&self, id: &JobId, payload: &[u8]) -> Result<(), ChannelError>;

    /// Look for completion artifacts for `pending` jobs.
    async fn probe(&self, pending: &[JobId]) -> Result<Vec<Completion>, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("folder".parse::<ChannelKind>().unwrap(), ChannelKind::Folder);
        assert_eq!("Drive".parse::<ChannelKind>().unwrap(), ChannelKind::Folder);
        assert_eq!(" mail ".parse::<ChannelKind>().unwrap(), ChannelKind::Mail);
        assert_eq!("EMAIL".parse::<ChannelKind>().unwrap(), ChannelKind::Mail);
        assert!("fax".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn kind_serde_matches_display() {
        for kind in [ChannelKind::Folder, ChannelKind::Mail] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }
}
