use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::camera_registry::CameraRegistry;
use crate::config::Config;
use crate::errors::{Result, StreamError};
use crate::recording::{self, JobStatus, RecordingJob};
use crate::recording_lock::RecordingLock;
use crate::segment_store::{Manifest, SegmentStore};
use crate::snapshot_cache::{Snapshot, SnapshotCache, SnapshotSettings};
use crate::source::{ByteStream, SourceFetcher};
use crate::transcoder::Transcoder;

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub segment_duration: Duration,
    pub retention_segments: usize,
    pub lock_timeout: Duration,
    pub output_directory: PathBuf,
    /// Prepended to manifest URLs. Empty yields server-relative URLs.
    pub manifest_base_url: String,
}

impl RecordingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            segment_duration: config.recording.segment_duration,
            retention_segments: config.recording.retention_segments,
            lock_timeout: config.recording.lock_timeout,
            output_directory: PathBuf::from(&config.recording.output_directory),
            manifest_base_url: config.server.public_base_url.clone().unwrap_or_default(),
        }
    }
}

/// Where a caller can follow a recording. The manifest may not list any segments yet.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingLocator {
    pub camera_id: String,
    pub job_id: Uuid,
    pub manifest_url: String,
    pub started_at: DateTime<Utc>,
    /// True when an already running job was handed back instead of launching a new one.
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub camera_id: String,
    pub job_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub status: Option<JobStatus>,
    pub lease_held: bool,
    pub segments: usize,
    pub latest_sequence: Option<u64>,
}

/// Entry point for every viewer request. Holds per-camera snapshot, lease, manifest
/// and job state; cameras never share locks with each other.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<CameraRegistry>,
    fetcher: Arc<dyn SourceFetcher>,
    transcoder: Arc<dyn Transcoder>,
    snapshots: SnapshotCache,
    lock: RecordingLock,
    store: SegmentStore,
    jobs: Arc<RwLock<HashMap<String, Arc<RecordingJob>>>>,
    recording: RecordingSettings,
}

impl SessionManager {
    pub fn new(
        registry: Arc<CameraRegistry>,
        fetcher: Arc<dyn SourceFetcher>,
        transcoder: Arc<dyn Transcoder>,
        snapshot: SnapshotSettings,
        recording: RecordingSettings,
    ) -> Self {
        let snapshots = SnapshotCache::new(registry.clone(), fetcher.clone(), transcoder.clone(), snapshot);
        Self {
            registry,
            fetcher,
            transcoder,
            snapshots,
            lock: RecordingLock::new(),
            store: SegmentStore::new(recording.retention_segments),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            recording,
        }
    }

    pub fn from_config(
        config: &Config,
        registry: Arc<CameraRegistry>,
        fetcher: Arc<dyn SourceFetcher>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self::new(
            registry,
            fetcher,
            transcoder,
            SnapshotSettings::from(&config.snapshot),
            RecordingSettings::from_config(config),
        )
    }

    pub fn list_cameras(&self) -> Vec<String> {
        self.registry.list()
    }

    pub async fn get_snapshot(&self, camera_id: &str) -> Result<Arc<Snapshot>> {
        self.snapshots.get(camera_id).await
    }

    pub async fn subscribe_snapshots(&self, camera_id: &str) -> Result<broadcast::Receiver<Arc<Snapshot>>> {
        self.snapshots.subscribe(camera_id).await
    }

    /// Live feed straight from the camera, one upstream connection per caller.
    pub async fn open_source(&self, camera_id: &str) -> Result<ByteStream> {
        let locator = self.registry.resolve(camera_id)?;
        self.fetcher.fetch(locator).await
    }

    fn manifest_url(&self, camera_id: &str) -> String {
        format!(
            "{}/api/videostream/{}/playlist.m3u8",
            self.recording.manifest_base_url.trim_end_matches('/'),
            camera_id
        )
    }

    fn locator_for(&self, job: &RecordingJob, reused: bool) -> RecordingLocator {
        RecordingLocator {
            camera_id: job.camera_id.clone(),
            job_id: job.job_id,
            manifest_url: self.manifest_url(&job.camera_id),
            started_at: job.started_at,
            reused,
        }
    }

    async fn active_job(&self, camera_id: &str) -> Option<Arc<RecordingJob>> {
        self.jobs
            .read()
            .await
            .get(camera_id)
            .filter(|job| job.is_active())
            .cloned()
    }

    /// Launch a segment recording for the camera, or hand back the one already running.
    ///
    /// Returns as soon as the transcode is spawned. The lease only covers setup, so a
    /// second caller waits at most `lock_timeout` and then gets `Busy`.
    pub async fn start_recording(&self, camera_id: &str) -> Result<RecordingLocator> {
        let locator = self.registry.resolve(camera_id)?.clone();

        let Some(lease) = self.lock.acquire_guard(camera_id, self.recording.lock_timeout).await else {
            warn!("Camera '{}' is busy, recording lease not acquired", camera_id);
            return Err(StreamError::busy("Camera is currently in use"));
        };

        if let Some(job) = self.active_job(camera_id).await {
            info!("Camera '{}' already recording as job {}, reusing it", camera_id, job.job_id);
            return Ok(self.locator_for(&job, true));
        }

        self.store.reset(camera_id).await;
        let previous = self.jobs.write().await.remove(camera_id);
        if let Some(previous) = previous {
            remove_job_dir(&previous.output_dir).await;
        }

        let job_id = Uuid::new_v4();
        let output_dir = self.recording.output_directory.join(camera_id).join(job_id.to_string());
        tokio::fs::create_dir_all(&output_dir).await?;

        let input = match self.fetcher.fetch(&locator).await {
            Ok(input) => input,
            Err(e) => {
                warn!("Failed to open source for camera '{}': {}", camera_id, e);
                remove_job_dir(&output_dir).await;
                return Err(e);
            }
        };

        let job = recording::launch(
            camera_id,
            job_id,
            output_dir,
            input,
            self.recording.segment_duration,
            self.transcoder.clone(),
            self.store.clone(),
        );
        self.jobs.write().await.insert(camera_id.to_string(), job.clone());
        lease.release();

        info!("Recording job {} launched for camera '{}' into {:?}", job_id, camera_id, job.output_dir);
        Ok(self.locator_for(&job, false))
    }

    /// Cancel the camera's running job. Returns `false` when nothing was running.
    pub async fn stop_recording(&self, camera_id: &str) -> Result<bool> {
        self.registry.resolve(camera_id)?;
        let Some(_lease) = self.lock.acquire_guard(camera_id, self.recording.lock_timeout).await else {
            return Err(StreamError::busy("Camera is currently in use"));
        };

        match self.active_job(camera_id).await {
            Some(job) => {
                job.cancel();
                Ok(true)
            }
            None => {
                debug!("No running recording to stop for camera '{}'", camera_id);
                Ok(false)
            }
        }
    }

    pub async fn recording_job(&self, camera_id: &str) -> Option<Arc<RecordingJob>> {
        self.jobs.read().await.get(camera_id).cloned()
    }

    pub async fn recording_status(&self, camera_id: &str) -> Result<RecordingStatus> {
        self.registry.resolve(camera_id)?;
        let job = self.recording_job(camera_id).await;
        let manifest = self.store.manifest(camera_id).await;

        Ok(RecordingStatus {
            camera_id: camera_id.to_string(),
            job_id: job.as_ref().map(|job| job.job_id),
            started_at: job.as_ref().map(|job| job.started_at),
            status: job.as_ref().map(|job| job.status()),
            lease_held: self.lock.is_held(camera_id),
            segments: manifest.len(),
            latest_sequence: manifest.segments.last().map(|s| s.sequence),
        })
    }

    pub fn is_recording_lease_held(&self, camera_id: &str) -> bool {
        self.lock.is_held(camera_id)
    }

    pub async fn manifest(&self, camera_id: &str) -> Result<Manifest> {
        self.registry.resolve(camera_id)?;
        Ok(self.store.manifest(camera_id).await)
    }

    /// HLS playlist for the camera, closed with `#EXT-X-ENDLIST` once its job has ended.
    pub async fn playlist(&self, camera_id: &str) -> Result<String> {
        let manifest = self.manifest(camera_id).await?;
        let ended = self
            .recording_job(camera_id)
            .await
            .is_some_and(|job| !job.is_active());
        Ok(manifest.to_m3u8(ended))
    }

    pub async fn read_segment(&self, camera_id: &str, sequence: u64) -> Result<Bytes> {
        self.registry.resolve(camera_id)?;
        self.store.read_segment(camera_id, sequence).await
    }

    pub async fn shutdown(&self) {
        info!("Shutting down session manager");
        self.snapshots.shutdown().await;
        for (camera_id, job) in self.jobs.read().await.iter() {
            if job.is_active() {
                debug!("Cancelling recording job {} for camera '{}'", job.job_id, camera_id);
                job.cancel();
            }
        }
    }
}

async fn remove_job_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed recording directory {:?}", dir),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove recording directory {:?}: {}", dir, e),
    }
}
