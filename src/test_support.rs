//! Scripted sources and transcoders shared by unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream;
use url::Url;

use crate::errors::{Result, StreamError};
use crate::mjpeg::{multipart_part, MjpegFrameReader};
use crate::segment_store::Segment;
use crate::source::{ByteStream, SourceFetcher};
use crate::transcoder::{SegmentSink, Transcoder};

/// Fake JPEG: SOI, ascii label, EOI.
pub fn labelled_frame(label: &str) -> Bytes {
    let mut frame = vec![0xFF, 0xD8];
    frame.extend_from_slice(label.as_bytes());
    frame.extend_from_slice(&[0xFF, 0xD9]);
    Bytes::from(frame)
}

pub fn frame_label(frame: &[u8]) -> String {
    String::from_utf8_lossy(&frame[2..frame.len() - 2]).into_owned()
}

/// Every fetch yields `frames_per_fetch` frames labelled `fetch-<n>-frame-<k>`.
pub struct ScriptedFetcher {
    frames_per_fetch: usize,
    frame_interval: Duration,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl ScriptedFetcher {
    pub fn new(frames_per_fetch: usize) -> Self {
        Self {
            frames_per_fetch,
            frame_interval: Duration::from_millis(5),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch(&self, locator: &Url) -> Result<ByteStream> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StreamError::source_unavailable(format!("{} is offline", locator)));
        }
        let fetch_number = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.frames_per_fetch;
        let interval = self.frame_interval;

        let frames = stream::unfold(1usize, move |k| async move {
            if k > total {
                return None;
            }
            if k > 1 {
                tokio::time::sleep(interval).await;
            }
            let frame = labelled_frame(&format!("fetch-{}-frame-{}", fetch_number, k));
            Some((Ok(multipart_part(&frame)), k + 1))
        });
        Ok(Box::pin(frames))
    }
}

/// Counts invocations and sleeps `delay` before producing each output.
/// In segment mode every `frames_per_segment` input frames become one `.ts` file.
pub struct SlowFrameTranscoder {
    delay: Duration,
    frames_per_segment: usize,
    calls: AtomicUsize,
    segment_launches: AtomicUsize,
    fail_segments: AtomicBool,
}

impl SlowFrameTranscoder {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            frames_per_segment: 2,
            calls: AtomicUsize::new(0),
            segment_launches: AtomicUsize::new(0),
            fail_segments: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn segment_launches(&self) -> usize {
        self.segment_launches.load(Ordering::SeqCst)
    }

    pub fn set_fail_segments(&self, fail: bool) {
        self.fail_segments.store(fail, Ordering::SeqCst);
    }
}

async fn write_segment(dir: &Path, sequence: u64, payload: &[u8]) -> Result<Segment> {
    let path = dir.join(format!("segment_{:06}.ts", sequence));
    tokio::fs::write(&path, payload).await?;
    Ok(Segment {
        sequence,
        path,
        duration: Duration::from_millis(100),
        created_at: Utc::now(),
    })
}

#[async_trait]
impl Transcoder for SlowFrameTranscoder {
    async fn transcode_one_frame(&self, input: ByteStream) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        MjpegFrameReader::new(input)
            .next_frame()
            .await?
            .ok_or_else(|| StreamError::transcode("no frame"))
    }

    async fn transcode_to_segments(
        &self,
        input: ByteStream,
        _segment_duration: Duration,
        sink: Arc<dyn SegmentSink>,
    ) -> Result<()> {
        self.segment_launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_segments.load(Ordering::SeqCst) {
            return Err(StreamError::transcode("encoder crashed"));
        }

        let mut reader = MjpegFrameReader::new(input);
        let mut pending = Vec::new();
        let mut buffered = 0;
        let mut sequence = 0u64;
        while let Some(frame) = reader.next_frame().await? {
            pending.extend_from_slice(&frame);
            buffered += 1;
            if buffered == self.frames_per_segment {
                tokio::time::sleep(self.delay).await;
                let segment = write_segment(sink.output_dir(), sequence, &pending).await?;
                sink.on_segment_ready(segment).await?;
                pending.clear();
                buffered = 0;
                sequence += 1;
            }
        }
        Ok(())
    }
}
