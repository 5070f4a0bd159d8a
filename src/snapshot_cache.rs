use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::camera_registry::CameraRegistry;
use crate::config::SnapshotConfig;
use crate::errors::{Result, StreamError};
use crate::source::SourceFetcher;
use crate::transcoder::Transcoder;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub camera_id: String,
    pub frame: Bytes,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub refresh_interval: Duration,
    pub capture_timeout: Duration,
    /// Stop refreshing and drop the cached frame after this long without viewers.
    pub idle_timeout: Option<Duration>,
    pub subscriber_buffer: usize,
}

impl From<&SnapshotConfig> for SnapshotSettings {
    fn from(config: &SnapshotConfig) -> Self {
        Self {
            refresh_interval: config.refresh_interval,
            capture_timeout: config.capture_timeout,
            idle_timeout: config.idle_eviction.then_some(config.idle_timeout),
            subscriber_buffer: config.subscriber_buffer.max(1),
        }
    }
}

/// Per-camera cache slot. Owns the camera's refresh task.
struct CameraSnapshot {
    latest: RwLock<Option<Arc<Snapshot>>>,
    init_gate: Mutex<()>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    updates: broadcast::Sender<Arc<Snapshot>>,
    last_access_ms: AtomicI64,
}

impl CameraSnapshot {
    fn new(subscriber_buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(subscriber_buffer);
        Self {
            latest: RwLock::new(None),
            init_gate: Mutex::new(()),
            refresh_task: Mutex::new(None),
            updates,
            last_access_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    fn touch(&self) {
        self.last_access_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let idle_ms = Utc::now().timestamp_millis() - self.last_access_ms.load(Ordering::Relaxed);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    async fn current(&self) -> Option<Arc<Snapshot>> {
        self.latest.read().await.clone()
    }

    async fn store(&self, snapshot: Arc<Snapshot>) {
        *self.latest.write().await = Some(snapshot.clone());
        // No subscribers is fine
        let _ = self.updates.send(snapshot);
    }

    async fn clear(&self) {
        *self.latest.write().await = None;
    }
}

fn is_idle(slot: &CameraSnapshot, idle_timeout: Duration) -> bool {
    slot.updates.receiver_count() == 0 && slot.idle_for() >= idle_timeout
}

/// Latest still frame per camera, served to any number of concurrent readers while
/// a single background task per camera keeps it fresh.
#[derive(Clone)]
pub struct SnapshotCache {
    registry: Arc<CameraRegistry>,
    fetcher: Arc<dyn SourceFetcher>,
    transcoder: Arc<dyn Transcoder>,
    settings: SnapshotSettings,
    slots: Arc<RwLock<HashMap<String, Arc<CameraSnapshot>>>>,
}

impl SnapshotCache {
    pub fn new(
        registry: Arc<CameraRegistry>,
        fetcher: Arc<dyn SourceFetcher>,
        transcoder: Arc<dyn Transcoder>,
        settings: SnapshotSettings,
    ) -> Self {
        Self {
            registry,
            fetcher,
            transcoder,
            settings,
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn slot(&self, camera_id: &str) -> Arc<CameraSnapshot> {
        if let Some(slot) = self.slots.read().await.get(camera_id) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(camera_id.to_string())
            .or_insert_with(|| Arc::new(CameraSnapshot::new(self.settings.subscriber_buffer)))
            .clone()
    }

    /// Latest snapshot for the camera. The first caller captures one synchronously;
    /// concurrent first callers wait for that capture instead of starting their own.
    pub async fn get(&self, camera_id: &str) -> Result<Arc<Snapshot>> {
        let locator = self.registry.resolve(camera_id)?.clone();
        let slot = self.slot(camera_id).await;
        slot.touch();

        if let Some(snapshot) = slot.current().await {
            return Ok(snapshot);
        }

        let _gate = slot.init_gate.lock().await;
        if let Some(snapshot) = slot.current().await {
            return Ok(snapshot);
        }

        info!("Initializing snapshot cache for camera '{}'", camera_id);
        let snapshot = Arc::new(self.capture(camera_id, &locator).await?);
        slot.store(snapshot.clone()).await;
        self.start_refresh(camera_id, &slot, locator).await;
        Ok(snapshot)
    }

    /// Cached snapshot without triggering a capture.
    pub async fn peek(&self, camera_id: &str) -> Option<Arc<Snapshot>> {
        let slot = self.slots.read().await.get(camera_id).cloned()?;
        slot.current().await
    }

    pub async fn subscribe(&self, camera_id: &str) -> Result<broadcast::Receiver<Arc<Snapshot>>> {
        self.registry.resolve(camera_id)?;
        let slot = self.slot(camera_id).await;
        slot.touch();
        Ok(slot.updates.subscribe())
    }

    async fn capture(&self, camera_id: &str, locator: &Url) -> Result<Snapshot> {
        let work = async {
            let input = self.fetcher.fetch(locator).await?;
            self.transcoder.transcode_one_frame(input).await
        };

        let frame = tokio::time::timeout(self.settings.capture_timeout, work)
            .await
            .map_err(|_| {
                StreamError::source_unavailable(format!(
                    "Capture for camera '{}' timed out after {:?}",
                    camera_id, self.settings.capture_timeout
                ))
            })??;

        Ok(Snapshot {
            camera_id: camera_id.to_string(),
            frame,
            captured_at: Utc::now(),
        })
    }

    async fn start_refresh(&self, camera_id: &str, slot: &Arc<CameraSnapshot>, locator: Url) {
        let mut task = slot.refresh_task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Refresh task for camera '{}' already running", camera_id);
            return;
        }

        let cache = self.clone();
        let camera_id = camera_id.to_string();
        let task_slot = slot.clone();
        *task = Some(tokio::spawn(async move {
            cache.refresh_loop(camera_id, task_slot, locator).await;
        }));
    }

    async fn refresh_loop(&self, camera_id: String, slot: Arc<CameraSnapshot>, locator: Url) {
        let mut ticker = tokio::time::interval(self.settings.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately, the initial capture already happened
        ticker.tick().await;
        info!(
            "Snapshot refresh started for camera '{}' every {:?}",
            camera_id, self.settings.refresh_interval
        );

        loop {
            ticker.tick().await;

            if let Some(idle_timeout) = self.settings.idle_timeout {
                if is_idle(&slot, idle_timeout) && self.evict_idle(&camera_id, &slot, idle_timeout).await {
                    break;
                }
            }

            match self.capture(&camera_id, &locator).await {
                Ok(snapshot) => slot.store(Arc::new(snapshot)).await,
                Err(e) => warn!(
                    "Snapshot refresh failed for camera '{}', keeping previous frame: {}",
                    camera_id, e
                ),
            }
        }
    }

    /// Clear the slot and detach this task from it. Runs under the init gate so a
    /// concurrent `get` either keeps the camera alive or re-initializes after eviction.
    async fn evict_idle(&self, camera_id: &str, slot: &CameraSnapshot, idle_timeout: Duration) -> bool {
        let _gate = slot.init_gate.lock().await;
        if !is_idle(slot, idle_timeout) {
            return false;
        }

        info!("Camera '{}' idle for {:?}, stopping snapshot refresh", camera_id, slot.idle_for());
        slot.refresh_task.lock().await.take();
        slot.clear().await;
        true
    }

    pub async fn is_refreshing(&self, camera_id: &str) -> bool {
        let Some(slot) = self.slots.read().await.get(camera_id).cloned() else {
            return false;
        };
        let task = slot.refresh_task.lock().await;
        task.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel one camera's refresh task and drop its cached frame. Subscribers stay
    /// attached and receive frames again once the camera is re-initialized.
    pub async fn stop(&self, camera_id: &str) {
        let Some(slot) = self.slots.read().await.get(camera_id).cloned() else {
            return;
        };
        let _gate = slot.init_gate.lock().await;
        if let Some(handle) = slot.refresh_task.lock().await.take() {
            handle.abort();
            info!("Cancelled snapshot refresh for camera '{}'", camera_id);
        }
        slot.clear().await;
    }

    pub async fn shutdown(&self) {
        let slots: Vec<(String, Arc<CameraSnapshot>)> = self.slots.write().await.drain().collect();
        for (camera_id, slot) in slots {
            if let Some(handle) = slot.refresh_task.lock().await.take() {
                handle.abort();
                debug!("Cancelled snapshot refresh for camera '{}'", camera_id);
            }
        }
    }
}
