//! Reconciliation engine: submission and status lookups.
//!
//! Submissions are dispatched first and recorded second: a job only
//! appears in the store once its payload has actually left the process.
//! Queries are plain store reads; probing belongs to the watchers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::channels::{Channel, ChannelKind};
use crate::error::{Error, JobError, Result};
use crate::store::{JobId, JobStatus, JobStore};

/// What a caller sees when asking about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobView {
    NotFound,
    Waiting,
    Done(Vec<u8>),
    Failed(String),
}

/// Routes submissions to channels and answers status queries.
pub struct ReconciliationEngine {
    store: Arc<JobStore>,
    channels: HashMap<ChannelKind, Arc<dyn Channel>>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            channels: HashMap::new(),
        }
    }

    /// Register a channel. A later channel of the same kind replaces the earlier one.
    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channels.insert(channel.kind(), channel);
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn channel(&self, kind: ChannelKind) -> Option<&Arc<dyn Channel>> {
        self.channels.get(&kind)
    }

    /// Configured channel kinds, in a stable order.
    pub fn channel_kinds(&self) -> Vec<ChannelKind> {
        let mut kinds: Vec<ChannelKind> = self.channels.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }

    /// Dispatch `payload` through `kind` and start tracking it.
    ///
    /// On dispatch failure nothing is recorded and the error is returned.
    pub async fn submit(&self, payload: &[u8], kind: ChannelKind) -> Result<JobId> {
        let channel = self
            .channels
            .get(&kind)
            .ok_or(JobError::ChannelNotConfigured { channel: kind })?;

        let id = JobId::generate();

        // No store lock is held while the payload is in flight.
        if let Err(e) = channel.dispatch(&id, payload).await {
            error!(job_id = %id, channel = %kind, error = %e, "Dispatch failed; no job created");
            return Err(Error::Channel(e));
        }

        let job = self.store.create(id, kind).await.map_err(|e| {
            error!(error = %e, "Job id collision after dispatch");
            Error::Job(e)
        })?;

        info!(job_id = %job.id, channel = %kind, bytes = payload.len(), "Submission accepted");
        Ok(job.id)
    }

    /// Current view of a job. Never touches a channel.
    pub async fn query(&self, id: &JobId) -> JobView {
        match self.store.get(id).await.map(|job| job.status) {
            None => JobView::NotFound,
            Some(JobStatus::Waiting) => JobView::Waiting,
            Some(JobStatus::Done { result }) => JobView::Done(result),
            Some(JobStatus::Failed { reason }) => JobView::Failed(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::Completion;
    use crate::error::ChannelError;

    /// Channel double that records dispatches and can be told to fail.
    struct RecordingChannel {
        kind: ChannelKind,
        fail: bool,
        dispatched: Mutex<Vec<(JobId, Vec<u8>)>>,
    }

    impl RecordingChannel {
        fn new(kind: ChannelKind, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail,
                dispatched: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn dispatch(&self, id: &JobId, payload: &[u8]) -> std::result::Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::DispatchFailed {
                    name: self.kind.to_string(),
                    reason: "network unreachable".into(),
                });
            }
            self.dispatched.lock().unwrap().push((id.clone(), payload.to_vec()));
            Ok(())
        }

        async fn probe(&self, _pending: &[JobId]) -> std::result::Result<Vec<Completion>, ChannelError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn query_before_submit_is_not_found() {
        let engine = ReconciliationEngine::new(JobStore::new());
        assert_eq!(engine.query(&JobId::from("doesnotexist")).await, JobView::NotFound);
    }

    #[tokio::test]
    async fn submit_dispatches_then_waits() {
        let channel = RecordingChannel::new(ChannelKind::Folder, false);
        let engine = ReconciliationEngine::new(JobStore::new()).with_channel(channel.clone());

        let id = engine.submit(b"ACGT", ChannelKind::Folder).await.unwrap();

        assert_eq!(engine.query(&id).await, JobView::Waiting);
        let dispatched = channel.dispatched.lock().unwrap();
        assert_eq!(*dispatched, vec![(id.clone(), b"ACGT".to_vec())]);
    }

    #[tokio::test]
    async fn dispatch_failure_creates_no_job() {
        let channel = RecordingChannel::new(ChannelKind::Mail, true);
        let store = JobStore::new();
        let engine = ReconciliationEngine::new(Arc::clone(&store)).with_channel(channel);

        let err = engine.submit(b"ACGT", ChannelKind::Mail).await.unwrap_err();
        assert!(matches!(err, Error::Channel(ChannelError::DispatchFailed { .. })));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn submit_to_unconfigured_channel_fails() {
        let engine = ReconciliationEngine::new(JobStore::new())
            .with_channel(RecordingChannel::new(ChannelKind::Folder, false));

        let err = engine.submit(b"x", ChannelKind::Mail).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Job(JobError::ChannelNotConfigured { channel: ChannelKind::Mail })
        ));
    }

    #[tokio::test]
    async fn query_reflects_store_transitions() {
        let store = JobStore::new();
        let engine = ReconciliationEngine::new(Arc::clone(&store))
            .with_channel(RecordingChannel::new(ChannelKind::Folder, false));

        let done = engine.submit(b"a", ChannelKind::Folder).await.unwrap();
        let failed = engine.submit(b"b", ChannelKind::Folder).await.unwrap();
        store.resolve(&done, b"chr1".to_vec()).await;
        store.fail(&failed, "expired").await;

        assert_eq!(engine.query(&done).await, JobView::Done(b"chr1".to_vec()));
        assert_eq!(engine.query(&failed).await, JobView::Failed("expired".into()));
    }

    #[tokio::test]
    async fn submissions_get_distinct_ids() {
        let engine = ReconciliationEngine::new(JobStore::new())
            .with_channel(RecordingChannel::new(ChannelKind::Folder, false));

        let a = engine.submit(b"x", ChannelKind::Folder).await.unwrap();
        let b = engine.submit(b"x", ChannelKind::Folder).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(engine.store().len().await, 2);
    }

    #[test]
    fn channel_kinds_sorted() {
        let engine = ReconciliationEngine::new(JobStore::new())
            .with_channel(RecordingChannel::new(ChannelKind::Mail, false))
            .with_channel(RecordingChannel::new(ChannelKind::Folder, false));
        assert_eq!(engine.channel_kinds(), vec![ChannelKind::Folder, ChannelKind::Mail]);
        assert!(engine.channel(ChannelKind::Mail).is_some());
    }
}
