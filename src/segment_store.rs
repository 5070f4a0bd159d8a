use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::{Result, StreamError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub sequence: u64,
    pub path: PathBuf,
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
}

/// Playback-ordered view of a camera's retained segments, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub camera_id: String,
    pub segments: Vec<Segment>,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Render as an HLS playlist. Segment URIs are relative: `segments/<sequence>.ts`.
    /// `ended` closes the playlist so players stop polling a finished recording.
    pub fn to_m3u8(&self, ended: bool) -> String {
        let media_sequence = self.segments.first().map(|s| s.sequence).unwrap_or(0);
        let target_duration = self
            .segments
            .iter()
            .map(|s| s.duration.as_secs_f64().ceil() as u64)
            .max()
            .unwrap_or(1)
            .max(1);

        let mut playlist = String::new();
        playlist.push_str("#EXTM3U\n");
        playlist.push_str("#EXT-X-VERSION:3\n");
        playlist.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target_duration));
        playlist.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", media_sequence));
        for segment in &self.segments {
            playlist.push_str(&format!("#EXTINF:{:.3},\n", segment.duration.as_secs_f64()));
            playlist.push_str(&format!("segments/{}.ts\n", segment.sequence));
        }
        if ended {
            playlist.push_str("#EXT-X-ENDLIST\n");
        }
        playlist
    }
}

type CameraSegments = Arc<RwLock<VecDeque<Segment>>>;

/// Rolling window of recording segments per camera. Append and eviction happen
/// under one write lock; backing files of evicted segments are deleted afterwards.
#[derive(Clone)]
pub struct SegmentStore {
    retention: usize,
    cameras: Arc<RwLock<HashMap<String, CameraSegments>>>,
}

impl SegmentStore {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            cameras: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    async fn camera_segments(&self, camera_id: &str) -> CameraSegments {
        if let Some(segments) = self.cameras.read().await.get(camera_id) {
            return segments.clone();
        }
        let mut cameras = self.cameras.write().await;
        cameras
            .entry(camera_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(VecDeque::new())))
            .clone()
    }

    pub async fn append_segment(&self, camera_id: &str, segment: Segment) -> Result<()> {
        let entry = self.camera_segments(camera_id).await;

        let evicted = {
            let mut segments = entry.write().await;
            if let Some(last) = segments.back() {
                if segment.sequence <= last.sequence {
                    return Err(StreamError::transcode(format!(
                        "Segment {} for camera '{}' is not newer than segment {}",
                        segment.sequence, camera_id, last.sequence
                    )));
                }
            }

            debug!("Camera '{}': segment {} ready ({:?})", camera_id, segment.sequence, segment.duration);
            segments.push_back(segment);

            let mut evicted = Vec::new();
            while segments.len() > self.retention {
                if let Some(oldest) = segments.pop_front() {
                    evicted.push(oldest);
                }
            }
            evicted
        };

        for segment in evicted {
            remove_segment_file(camera_id, &segment).await;
        }
        Ok(())
    }

    pub async fn manifest(&self, camera_id: &str) -> Manifest {
        let segments = match self.cameras.read().await.get(camera_id) {
            Some(entry) => entry.clone(),
            None => {
                return Manifest { camera_id: camera_id.to_string(), segments: Vec::new() };
            }
        };

        let segments = segments.read().await;
        Manifest {
            camera_id: camera_id.to_string(),
            segments: segments.iter().cloned().collect(),
        }
    }

    pub async fn read_segment(&self, camera_id: &str, sequence: u64) -> Result<Bytes> {
        let path = {
            let manifest = self.manifest(camera_id).await;
            manifest
                .segments
                .into_iter()
                .find(|s| s.sequence == sequence)
                .map(|s| s.path)
                .ok_or_else(|| {
                    StreamError::not_found(format!("Segment {} for camera '{}' not found", sequence, camera_id))
                })?
        };

        // Eviction may delete the file between the lookup and the read
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StreamError::not_found(format!(
                "Segment {} for camera '{}' was evicted",
                sequence, camera_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every segment of a camera, files included.
    pub async fn reset(&self, camera_id: &str) {
        let Some(entry) = self.cameras.read().await.get(camera_id).cloned() else {
            return;
        };

        let removed: Vec<Segment> = entry.write().await.drain(..).collect();
        if !removed.is_empty() {
            info!("Reset manifest for camera '{}', removing {} segment(s)", camera_id, removed.len());
        }
        for segment in removed {
            remove_segment_file(camera_id, &segment).await;
        }
    }
}

async fn remove_segment_file(camera_id: &str, segment: &Segment) {
    match tokio::fs::remove_file(&segment.path).await {
        Ok(()) => debug!("Camera '{}': evicted segment {}", camera_id, segment.sequence),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Camera '{}': failed to delete segment file {:?}: {}",
            camera_id, segment.path, e
        ),
    }
}
