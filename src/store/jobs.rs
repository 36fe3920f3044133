//! Job store: in-memory table of submitted jobs and their results.
//!
//! The store is the only owner of `Job` records. Callers get clones back
//! and propose transitions through `resolve` / `fail`, which are checked
//! against the current state under the write lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::error::JobError;

/// Session identifier handed to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh, unguessable identifier (random v4 UUID).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Status of a job. The result lives inside `Done`, so it exists iff the
/// job is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Dispatched, waiting for the out-of-band agent.
    Waiting,
    /// Result captured from the channel.
    Done { result: Vec<u8> },
    /// Given up on (reaped after exceeding the maximum age).
    Failed { reason: String },
}

impl JobStatus {
    /// Done and Failed are terminal; nothing moves a job out of them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Waiting)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
        };
        write!(f, "{s}")
    }
}

/// A tracked unit of submitted work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Channel the payload was dispatched through.
    pub channel: ChannelKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    fn new(id: JobId, channel: ChannelKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            channel,
            status: JobStatus::Waiting,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a proposed transition did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The job moved out of Waiting.
    Applied,
    /// The job was already Done or Failed; nothing changed.
    Stale,
    /// No job with that id.
    NotFound,
}

/// Snapshot of how many jobs are in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub done: usize,
    pub failed: usize,
}

/// Concurrent-safe job table.
#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl JobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a new Waiting job. Never overwrites an existing entry.
    pub async fn create(&self, id: JobId, channel: ChannelKind) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&id) {
            return Err(JobError::AlreadyExists { id });
        }

        let job = Job::new(id.clone(), channel);
        jobs.insert(id, job.clone());
        debug!(job_id = %job.id, channel = %channel, "Job created");
        Ok(job)
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Move a Waiting job to Done with `result`. First writer wins.
    pub async fn resolve(&self, id: &JobId, result: Vec<u8>) -> Transition {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            debug!(job_id = %id, "Resolve for unknown job ignored");
            return Transition::NotFound;
        };

        if job.status.is_terminal() {
            debug!(job_id = %id, status = %job.status, "Stale resolve ignored");
            return Transition::Stale;
        }

        let bytes = result.len();
        job.status = JobStatus::Done { result };
        job.updated_at = Utc::now();
        info!(job_id = %id, channel = %job.channel, bytes, "Job resolved");
        Transition::Applied
    }

    /// Move a Waiting job to Failed.
    pub async fn fail(&self, id: &JobId, reason: impl Into<String>) -> Transition {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Transition::NotFound;
        };

        if job.status.is_terminal() {
            return Transition::Stale;
        }

        let reason = reason.into();
        info!(job_id = %id, reason = %reason, "Job failed");
        job.status = JobStatus::Failed { reason };
        job.updated_at = Utc::now();
        Transition::Applied
    }

    /// Ids of all Waiting jobs dispatched through `channel`.
    pub async fn pending(&self, channel: ChannelKind) -> Vec<JobId> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|j| j.channel == channel && j.status == JobStatus::Waiting)
            .map(|j| j.id.clone())
            .collect()
    }

    /// Fail every Waiting job created more than `max_age` ago.
    /// Returns the number of jobs expired.
    pub async fn expire_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let reason = format!("no result after {}", describe_age(max_age));
        let mut jobs = self.jobs.write().await;
        let mut expired = 0;

        for job in jobs.values_mut() {
            if job.status == JobStatus::Waiting && job.created_at < cutoff {
                job.status = JobStatus::Failed {
                    reason: reason.clone(),
                };
                job.updated_at = Utc::now();
                expired += 1;
                debug!(job_id = %job.id, "Job expired");
            }
        }

        if expired > 0 {
            info!(count = expired, "Expired waiting jobs");
        }

        expired
    }

    pub async fn counts(&self) -> JobCounts {
        let jobs = self.jobs.read().await;
        jobs.values().fold(JobCounts::default(), |mut counts, job| {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Done { .. } => counts.done += 1,
                JobStatus::Failed { .. } => counts.failed += 1,
            }
            counts
        })
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

/// Whole seconds when exact, milliseconds otherwise.
fn describe_age(age: chrono::Duration) -> String {
    let ms = age.num_milliseconds();
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::from(s)
    }

    #[tokio::test]
    async fn create_starts_waiting() {
        let store = JobStore::new();
        assert!(store.is_empty().await);

        let job = store.create(id("abc123"), ChannelKind::Folder).await.unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&id("abc123")).await.unwrap().status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = JobStore::new();
        store.create(id("abc123"), ChannelKind::Folder).await.unwrap();
        store.resolve(&id("abc123"), b"first".to_vec()).await;

        let err = store.create(id("abc123"), ChannelKind::Mail).await.unwrap_err();
        assert!(matches!(err, JobError::AlreadyExists { .. }));

        // Existing entry untouched
        let job = store.get(&id("abc123")).await.unwrap();
        assert_eq!(job.channel, ChannelKind::Folder);
        assert_eq!(job.status, JobStatus::Done { result: b"first".to_vec() });
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = JobStore::new();
        assert!(store.get(&id("doesnotexist")).await.is_none());
    }

    #[tokio::test]
    async fn first_resolve_wins() {
        let store = JobStore::new();
        store.create(id("j1"), ChannelKind::Mail).await.unwrap();

        assert_eq!(store.resolve(&id("j1"), b"r1".to_vec()).await, Transition::Applied);
        assert_eq!(store.resolve(&id("j1"), b"r2".to_vec()).await, Transition::Stale);

        let job = store.get(&id("j1")).await.unwrap();
        assert_eq!(job.status, JobStatus::Done { result: b"r1".to_vec() });
    }

    #[tokio::test]
    async fn resolve_missing_is_noop() {
        let store = JobStore::new();
        assert_eq!(store.resolve(&id("ghost"), b"x".to_vec()).await, Transition::NotFound);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_resolves_apply_once() {
        let store = JobStore::new();
        store.create(id("race"), ChannelKind::Folder).await.unwrap();

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store.resolve(&JobId::from("race"), format!("r{i}").into_bytes()).await
                })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Transition::Applied => applied += 1,
                Transition::Stale => {}
                Transition::NotFound => panic!("job vanished"),
            }
        }
        assert_eq!(applied, 1);
        assert!(matches!(
            store.get(&id("race")).await.unwrap().status,
            JobStatus::Done { .. }
        ));
    }

    #[tokio::test]
    async fn failed_is_terminal() {
        let store = JobStore::new();
        store.create(id("j"), ChannelKind::Folder).await.unwrap();

        assert_eq!(store.fail(&id("j"), "gave up").await, Transition::Applied);
        assert_eq!(store.resolve(&id("j"), b"late".to_vec()).await, Transition::Stale);
        assert_eq!(store.fail(&id("j"), "again").await, Transition::Stale);
        assert_eq!(
            store.get(&id("j")).await.unwrap().status,
            JobStatus::Failed { reason: "gave up".into() }
        );
    }

    #[tokio::test]
    async fn pending_filters_by_channel_and_status() {
        let store = JobStore::new();
        store.create(id("f1"), ChannelKind::Folder).await.unwrap();
        store.create(id("f2"), ChannelKind::Folder).await.unwrap();
        store.create(id("m1"), ChannelKind::Mail).await.unwrap();
        store.resolve(&id("f2"), b"done".to_vec()).await;

        assert_eq!(store.pending(ChannelKind::Folder).await, vec![id("f1")]);
        assert_eq!(store.pending(ChannelKind::Mail).await, vec![id("m1")]);
    }

    #[tokio::test]
    async fn expire_only_touches_old_waiting_jobs() {
        let store = JobStore::new();
        store.create(id("old"), ChannelKind::Folder).await.unwrap();
        store.create(id("done"), ChannelKind::Folder).await.unwrap();
        store.resolve(&id("done"), b"ok".to_vec()).await;

        // Nothing is older than an hour yet
        assert_eq!(store.expire_older_than(chrono::Duration::hours(1)).await, 0);

        // Negative age puts the cutoff in the future
        assert_eq!(store.expire_older_than(chrono::Duration::seconds(-1)).await, 1);
        assert!(matches!(
            store.get(&id("old")).await.unwrap().status,
            JobStatus::Failed { .. }
        ));
        assert_eq!(
            store.get(&id("done")).await.unwrap().status,
            JobStatus::Done { result: b"ok".to_vec() }
        );
    }

    #[tokio::test]
    async fn sub_second_expiry_reason_keeps_milliseconds() {
        let store = JobStore::new();
        store.create(id("quick"), ChannelKind::Mail).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(store.expire_older_than(chrono::Duration::milliseconds(5)).await, 1);
        assert_eq!(
            store.get(&id("quick")).await.unwrap().status,
            JobStatus::Failed { reason: "no result after 5ms".into() }
        );
    }

    #[test]
    fn age_formatting() {
        assert_eq!(describe_age(chrono::Duration::hours(1)), "3600s");
        assert_eq!(describe_age(chrono::Duration::milliseconds(1500)), "1500ms");
        assert_eq!(describe_age(chrono::Duration::milliseconds(250)), "250ms");
    }

    #[tokio::test]
    async fn counts_by_status() {
        let store = JobStore::new();
        store.create(id("a"), ChannelKind::Folder).await.unwrap();
        store.create(id("b"), ChannelKind::Folder).await.unwrap();
        store.create(id("c"), ChannelKind::Mail).await.unwrap();
        store.resolve(&id("a"), b"x".to_vec()).await;
        store.fail(&id("b"), "timeout").await;

        assert_eq!(
            store.counts().await,
            JobCounts { waiting: 1, done: 1, failed: 1 }
        );
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }
}
