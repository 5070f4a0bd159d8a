use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::segment_store::{Segment, SegmentStore};
use crate::source::ByteStream;
use crate::transcoder::{SegmentSink, Transcoder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Launched,
    Completed,
    Failed { message: String },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Launched)
    }
}

/// Appends segments reported by the transcoder to the camera's manifest.
pub struct StoreSink {
    camera_id: String,
    output_dir: PathBuf,
    store: SegmentStore,
}

impl StoreSink {
    pub fn new(camera_id: impl Into<String>, output_dir: PathBuf, store: SegmentStore) -> Self {
        Self { camera_id: camera_id.into(), output_dir, store }
    }
}

#[async_trait]
impl SegmentSink for StoreSink {
    fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn on_segment_ready(&self, segment: Segment) -> Result<()> {
        self.store.append_segment(&self.camera_id, segment).await
    }
}

/// A launched segment transcode. Outlives the recording lease that guarded its setup.
pub struct RecordingJob {
    pub job_id: Uuid,
    pub camera_id: String,
    pub output_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    status: Arc<watch::Sender<JobStatus>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecordingJob {
    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        !self.status.borrow().is_terminal()
    }

    /// Resolves once the job has completed, failed or been cancelled.
    pub async fn wait(&self) -> JobStatus {
        let mut status = self.status.subscribe();
        loop {
            let current = status.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            if status.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Abort the transcode. Dropping its future kills the ffmpeg child and closes the source.
    pub fn cancel(&self) {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if transition(&self.status, JobStatus::Cancelled) {
            info!("Recording job {} for camera '{}' cancelled", self.job_id, self.camera_id);
        }
    }
}

/// Move from `Launched` to a terminal state. Terminal states are final.
fn transition(status: &watch::Sender<JobStatus>, next: JobStatus) -> bool {
    status.send_if_modified(|current| {
        if current.is_terminal() {
            return false;
        }
        *current = next;
        true
    })
}

/// Spawn the segment transcode for an already opened source stream.
pub fn launch(
    camera_id: &str,
    job_id: Uuid,
    output_dir: PathBuf,
    input: ByteStream,
    segment_duration: Duration,
    transcoder: Arc<dyn Transcoder>,
    store: SegmentStore,
) -> Arc<RecordingJob> {
    let (status, _) = watch::channel(JobStatus::Launched);
    let status = Arc::new(status);

    let job = Arc::new(RecordingJob {
        job_id,
        camera_id: camera_id.to_string(),
        output_dir: output_dir.clone(),
        started_at: Utc::now(),
        status: status.clone(),
        handle: Mutex::new(None),
    });

    let sink: Arc<dyn SegmentSink> = Arc::new(StoreSink::new(camera_id, output_dir, store));
    let camera_id = camera_id.to_string();
    let handle = tokio::spawn(async move {
        let result = transcoder.transcode_to_segments(input, segment_duration, sink).await;
        let next = match result {
            Ok(()) => {
                info!("Recording job {} for camera '{}' completed", job_id, camera_id);
                JobStatus::Completed
            }
            Err(e) => {
                error!("Recording job {} for camera '{}' failed: {}", job_id, camera_id, e);
                JobStatus::Failed { message: e.to_string() }
            }
        };
        if !transition(&status, next) {
            warn!("Recording job {} finished after it was already marked terminal", job_id);
        }
    });

    *job.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    job
}
