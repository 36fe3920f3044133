//! Remote folder channel: upload `{id}{upload_ext}`, wait for `{id}{result_ext}`.
//!
//! The folder itself is behind the `RemoteFolder` trait: a plain directory
//! shared with the agent (`LocalFolder`) or a Google Drive folder
//! (`DriveFolder`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::SecretString;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channels::drive::DriveFolder;
use crate::channels::{Channel, ChannelKind, Completion};
use crate::config::{EnvLookup, parse_or, process_env, require};
use crate::error::{ChannelError, ConfigError};
use crate::store::JobId;

// ── Configuration ───────────────────────────────────────────────────

/// Where the shared folder lives.
#[derive(Debug)]
pub enum FolderBackend {
    /// A directory on disk the agent also watches.
    Local { path: PathBuf },
    /// A Google Drive folder, addressed by its folder id.
    Drive {
        folder_id: String,
        access_token: SecretString,
    },
}

/// Folder channel configuration, built from environment variables.
#[derive(Debug)]
pub struct FolderConfig {
    pub backend: FolderBackend,
    /// Extension of uploaded payloads.
    pub upload_ext: String,
    /// Extension the agent writes results under.
    pub result_ext: String,
    pub poll_interval_secs: u64,
    /// Maximum number of jobs probed at once within a tick.
    pub probe_concurrency: usize,
}

impl FolderConfig {
    /// Build config from environment variables.
    /// Returns `None` if neither `FOLDER_PATH` nor `DRIVE_FOLDER_ID` is set (channel disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Option<Self>, ConfigError> {
        let backend = if let Some(path) = lookup("FOLDER_PATH") {
            FolderBackend::Local {
                path: PathBuf::from(path),
            }
        } else if let Some(folder_id) = lookup("DRIVE_FOLDER_ID") {
            let token = require(
                lookup,
                "DRIVE_ACCESS_TOKEN",
                "An OAuth access token with the drive scope is needed when DRIVE_FOLDER_ID is set.",
            )?;
            FolderBackend::Drive {
                folder_id,
                access_token: SecretString::from(token),
            }
        } else {
            return Ok(None);
        };

        let probe_concurrency = parse_or(lookup, "FOLDER_PROBE_CONCURRENCY", 4_usize)?;
        let poll_interval_secs = parse_or(lookup, "FOLDER_POLL_INTERVAL_SECS", 5_u64)?;
        if probe_concurrency == 0 || poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FOLDER_PROBE_CONCURRENCY / FOLDER_POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        Ok(Some(Self {
            backend,
            upload_ext: normalize_ext(&parse_or(lookup, "FOLDER_UPLOAD_EXT", ".vcf".to_string())?),
            result_ext: normalize_ext(&parse_or(lookup, "FOLDER_RESULT_EXT", ".txt".to_string())?),
            poll_interval_secs,
            probe_concurrency,
        }))
    }
}

/// `txt` and `.txt` both mean `.txt`.
fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim();
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}

// ── Folder backends ─────────────────────────────────────────────────

/// A file found in the remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Backend-specific handle (path name, Drive file id).
    pub id: String,
    pub name: String,
    /// Changes whenever the contents may have changed. `None` when the
    /// backend cannot tell, in which case the file is taken as complete.
    pub version: Option<String>,
}

/// A folder shared with the out-of-band agent.
#[async_trait]
pub trait RemoteFolder: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &str;

    /// Write `contents` under `name`.
    async fn upload(&self, name: &str, contents: Vec<u8>) -> Result<(), ChannelError>;

    /// Find a file by exact name.
    async fn find(&self, name: &str) -> Result<Option<RemoteFile>, ChannelError>;

    /// Fetch the full contents of a file returned by `find`.
    async fn download(&self, file: &RemoteFile) -> Result<Vec<u8>, ChannelError>;
}

/// A directory on the local filesystem (e.g. a network share or synced folder).
pub struct LocalFolder {
    root: PathBuf,
}

impl LocalFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` inside the root, rejecting anything that is not a plain file name.
    fn path_for(&self, name: &str) -> Result<PathBuf, ChannelError> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
            || name.contains("..")
        {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing file name outside the shared folder: {name:?}"),
            )));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl RemoteFolder for LocalFolder {
    fn backend(&self) -> &str {
        "local"
    }

    async fn upload(&self, name: &str, contents: Vec<u8>) -> Result<(), ChannelError> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.root).await?;

        // Write under a hidden name and rename, so a watching agent never sees a partial file.
        let staging = self.root.join(format!(".{name}.part"));
        fs::write(&staging, contents).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn find(&self, name: &str) -> Result<Option<RemoteFile>, ChannelError> {
        let path = self.path_for(name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(RemoteFile {
                id: name.to_string(),
                name: name.to_string(),
                version: Some(local_version(&meta)),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn download(&self, file: &RemoteFile) -> Result<Vec<u8>, ChannelError> {
        let path = self.path_for(&file.id)?;
        Ok(fs::read(path).await?)
    }
}

/// Size plus modification time.
fn local_version(meta: &std::fs::Metadata) -> String {
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}:{modified}", meta.len())
}

// ── Channel ─────────────────────────────────────────────────────────

/// Folder channel: one upload per job, one lookup per job per tick.
///
/// The agent may still be writing a result file when a tick finds it, so a
/// file is only downloaded once the same version has been seen on two
/// consecutive ticks.
pub struct RemoteFolderChannel {
    folder: Arc<dyn RemoteFolder>,
    upload_ext: String,
    result_ext: String,
    probe_concurrency: usize,
    /// Last version seen per pending job.
    sightings: Mutex<HashMap<JobId, String>>,
}

impl RemoteFolderChannel {
    pub fn new(folder: Arc<dyn RemoteFolder>, upload_ext: &str, result_ext: &str) -> Self {
        Self {
            folder,
            upload_ext: normalize_ext(upload_ext),
            result_ext: normalize_ext(result_ext),
            probe_concurrency: 4,
            sightings: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_probe_concurrency(mut self, limit: usize) -> Self {
        self.probe_concurrency = limit.max(1);
        self
    }

    /// Build the channel and its backend from config.
    pub fn from_config(config: FolderConfig) -> Result<Self, ChannelError> {
        let folder: Arc<dyn RemoteFolder> = match config.backend {
            FolderBackend::Local { path } => Arc::new(LocalFolder::new(path)),
            FolderBackend::Drive {
                folder_id,
                access_token,
            } => Arc::new(DriveFolder::new(folder_id, access_token)?),
        };

        info!(
            backend = folder.backend(),
            upload_ext = %config.upload_ext,
            result_ext = %config.result_ext,
            "Folder channel configured"
        );

        Ok(Self::new(folder, &config.upload_ext, &config.result_ext)
            .with_probe_concurrency(config.probe_concurrency))
    }

    pub fn upload_name(&self, id: &JobId) -> String {
        format!("{id}{}", self.upload_ext)
    }

    pub fn result_name(&self, id: &JobId) -> String {
        format!("{id}{}", self.result_ext)
    }

    /// Record this sighting; true if it matches the previous one.
    async fn settled(&self, id: &JobId, file: Option<&RemoteFile>) -> bool {
        let mut sightings = self.sightings.lock().await;
        let Some(file) = file else {
            sightings.remove(id);
            return false;
        };
        let Some(version) = &file.version else {
            return true;
        };
        let previous = sightings.insert(id.clone(), version.clone());
        previous.as_deref() == Some(version.as_str())
    }

    async fn probe_one(&self, id: &JobId) -> Result<Option<Vec<u8>>, ChannelError> {
        let name = self.result_name(id);
        let file = self.folder.find(&name).await?;
        if !self.settled(id, file.as_ref()).await {
            if file.is_some() {
                debug!(job_id = %id, file = %name, "Result file seen; waiting for it to settle");
            }
            return Ok(None);
        }
        let Some(file) = file else {
            return Ok(None);
        };

        let contents = self.folder.download(&file).await?;
        debug!(job_id = %id, file = %name, bytes = contents.len(), "Found result file");
        Ok(Some(contents))
    }
}

#[async_trait]
impl Channel for RemoteFolderChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Folder
    }

    async fn dispatch(&self, id: &JobId, payload: &[u8]) -> Result<(), ChannelError> {
        let name = self.upload_name(id);
        self.folder
            .upload(&name, payload.to_vec())
            .await
            .map_err(|e| ChannelError::DispatchFailed {
                name: "folder".into(),
                reason: format!("upload of {name} to {} failed: {e}", self.folder.backend()),
            })?;

        info!(job_id = %id, file = %name, "Uploaded payload to shared folder");
        Ok(())
    }

    /// Each job is looked up on its own; a failure for one job is logged
    /// and never stops the others.
    async fn probe(&self, pending: &[JobId]) -> Result<Vec<Completion>, ChannelError> {
        {
            let still_pending: HashSet<&JobId> = pending.iter().collect();
            self.sightings
                .lock()
                .await
                .retain(|id, _| still_pending.contains(id));
        }

        let completions: Vec<Completion> = futures::stream::iter(pending.iter().cloned())
            .map(|id| async move {
                let outcome = self.probe_one(&id).await;
                (id, outcome)
            })
            .buffer_unordered(self.probe_concurrency)
            .filter_map(|(id, outcome)| async move {
                match outcome {
                    Ok(Some(result)) => Some(Completion::new(id, result)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "Folder probe failed; retrying next tick");
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(completions)
    }
}
