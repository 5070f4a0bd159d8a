use std::collections::HashMap;
use tracing::info;
use url::Url;

use crate::config::CameraConfig;
use crate::errors::{Result, StreamError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraRecord {
    pub id: String,
    pub locator: Url,
}

/// Static camera id -> source locator mapping. Never mutated after construction,
/// so it is shared behind a plain `Arc`.
#[derive(Debug, Default)]
pub struct CameraRegistry {
    records: Vec<CameraRecord>,
    index: HashMap<String, usize>,
}

impl CameraRegistry {
    pub fn new<I, S, L>(cameras: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, L)>,
        S: Into<String>,
        L: AsRef<str>,
    {
        let mut registry = Self::default();
        for (id, locator) in cameras {
            let id = id.into();
            let locator = Url::parse(locator.as_ref()).map_err(|e| {
                StreamError::config(format!("Invalid source URL for camera '{}': {}", id, e))
            })?;

            if registry.index.contains_key(&id) {
                return Err(StreamError::config(format!("Camera '{}' registered twice", id)));
            }

            registry.index.insert(id.clone(), registry.records.len());
            registry.records.push(CameraRecord { id, locator });
        }
        Ok(registry)
    }

    pub fn from_config(cameras: &[CameraConfig]) -> Result<Self> {
        let enabled = cameras.iter().filter(|camera| {
            if !camera.is_enabled() {
                info!("Camera '{}' is disabled, not registering", camera.id);
            }
            camera.is_enabled()
        });

        let registry = Self::new(enabled.map(|camera| (camera.id.clone(), camera.url.as_str())))?;
        for record in &registry.records {
            info!("Registered camera '{}' -> {}", record.id, record.locator);
        }
        Ok(registry)
    }

    pub fn resolve(&self, camera_id: &str) -> Result<&Url> {
        self.index
            .get(camera_id)
            .map(|&i| &self.records[i].locator)
            .ok_or_else(|| StreamError::not_found(format!("Camera with ID {} not found", camera_id)))
    }

    /// Camera ids in registration order.
    pub fn list(&self) -> Vec<String> {
        self.records.iter().map(|record| record.id.clone()).collect()
    }

    pub fn contains(&self, camera_id: &str) -> bool {
        self.index.contains_key(camera_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
