use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::errors::{Result, StreamError};
use crate::mjpeg::multipart_part;

/// Raw camera output, read incrementally.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Open a long-lived stream for `locator`. Fails with `SourceUnavailable`.
    async fn fetch(&self, locator: &Url) -> Result<ByteStream>;
}

pub struct HttpSourceFetcher {
    client: reqwest::Client,
}

impl HttpSourceFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent("Camera-Relay-Server/1.0")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, locator: &Url) -> Result<ByteStream> {
        debug!("Connecting to camera source {}", locator);

        let response = self.client.get(locator.clone()).send().await.map_err(|e| {
            StreamError::source_unavailable(format!("Failed to connect to {}: {}", locator, e))
        })?;

        if !response.status().is_success() {
            return Err(StreamError::source_unavailable(format!(
                "Camera at {} responded with {}",
                locator,
                response.status()
            )));
        }

        let source = locator.to_string();
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                StreamError::source_unavailable(format!("Read from {} failed: {}", source, e))
            })
        });
        Ok(Box::pin(stream))
    }
}

/// Synthetic MJPEG feed for `test://pattern?frames=N&fps=F` locators.
///
/// The pattern runs on a clock started when the fetcher is created, so every new
/// connection joins the animation where it currently is, like a live camera.
pub struct TestPatternFetcher {
    width: u32,
    height: u32,
    epoch: Instant,
}

impl TestPatternFetcher {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, epoch: Instant::now() }
    }

    fn current_frame(&self, fps: u64) -> u64 {
        self.epoch.elapsed().as_millis() as u64 * fps / 1000
    }

    fn render_frame(width: u32, height: u32, frame_number: u64) -> Result<Bytes> {
        use image::{ImageBuffer, Rgb};

        let t = (frame_number % 255) as u32;
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let r = ((x + t * 8) % 255) as u8;
            let g = ((y + t * 4) % 255) as u8;
            let b = ((x + y + t * 16) % 255) as u8;
            Rgb([r, g, b])
        });

        let mut jpeg_data = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut jpeg_data), image::ImageFormat::Jpeg)
            .map_err(|e| StreamError::transcode(format!("Failed to encode test frame: {}", e)))?;
        Ok(Bytes::from(jpeg_data))
    }
}

impl Default for TestPatternFetcher {
    fn default() -> Self {
        Self::new(320, 240)
    }
}

#[async_trait]
impl SourceFetcher for TestPatternFetcher {
    async fn fetch(&self, locator: &Url) -> Result<ByteStream> {
        let mut frame_limit: Option<u64> = None;
        let mut fps: u64 = 10;
        for (key, value) in locator.query_pairs() {
            match key.as_ref() {
                "frames" => {
                    frame_limit = Some(value.parse().map_err(|_| {
                        StreamError::source_unavailable(format!("Invalid frames parameter in {}", locator))
                    })?)
                }
                "fps" => {
                    fps = value.parse::<u64>().ok().filter(|f| *f > 0).ok_or_else(|| {
                        StreamError::source_unavailable(format!("Invalid fps parameter in {}", locator))
                    })?
                }
                _ => {}
            }
        }

        info!("Starting test pattern source ({} fps, {:?} frames)", fps, frame_limit);
        let frame_interval = Duration::from_millis(1000 / fps);
        let (width, height) = (self.width, self.height);

        let first_frame = self.current_frame(fps);

        let frames = stream::unfold(0u64, move |emitted| async move {
            if frame_limit.is_some_and(|limit| emitted >= limit) {
                return None;
            }
            if emitted > 0 {
                tokio::time::sleep(frame_interval).await;
            }
            let part = Self::render_frame(width, height, first_frame + emitted)
                .map(|jpeg| multipart_part(&jpeg));
            Some((part, emitted + 1))
        });
        Ok(Box::pin(frames))
    }
}

/// Routes a locator to the fetcher for its scheme.
pub struct DefaultSourceFetcher {
    http: HttpSourceFetcher,
    pattern: TestPatternFetcher,
}

impl DefaultSourceFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpSourceFetcher::new(connect_timeout)?,
            pattern: TestPatternFetcher::default(),
        })
    }
}

#[async_trait]
impl SourceFetcher for DefaultSourceFetcher {
    async fn fetch(&self, locator: &Url) -> Result<ByteStream> {
        match locator.scheme() {
            "http" | "https" => self.http.fetch(locator).await,
            "test" => self.pattern.fetch(locator).await,
            other => Err(StreamError::source_unavailable(format!(
                "Unsupported source scheme '{}' in {}",
                other, locator
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mjpeg::MjpegFrameReader;

    #[tokio::test]
    async fn test_pattern_yields_requested_frame_count() {
        let fetcher = TestPatternFetcher::new(32, 24);
        let locator = Url::parse("test://pattern?frames=3&fps=1000").unwrap();
        let mut reader = MjpegFrameReader::new(fetcher.fetch(&locator).await.unwrap());

        let mut frames = Vec::new();
        while let Some(frame) = reader.next_frame().await.unwrap() {
            assert_eq!(&frame[..2], &[0xFF, 0xD8]);
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3);
        assert_ne!(frames[0], frames[1]);
    }

    #[tokio::test]
    async fn test_pattern_reconnect_resumes_animation() {
        let fetcher = TestPatternFetcher::new(32, 24);
        let locator = Url::parse("test://pattern?frames=1&fps=50").unwrap();

        let first = MjpegFrameReader::new(fetcher.fetch(&locator).await.unwrap())
            .next_frame()
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let later = MjpegFrameReader::new(fetcher.fetch(&locator).await.unwrap())
            .next_frame()
            .await
            .unwrap()
            .unwrap();

        assert_ne!(first, later);
    }

    #[tokio::test]
    async fn test_pattern_rejects_bad_parameters() {
        let fetcher = TestPatternFetcher::default();
        let locator = Url::parse("test://pattern?fps=0").unwrap();
        assert!(fetcher.fetch(&locator).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_source_unavailable() {
        let fetcher = DefaultSourceFetcher::new(Duration::from_secs(1)).unwrap();
        let locator = Url::parse("rtsp://10.0.0.1/stream").unwrap();
        let err = fetcher.fetch(&locator).await.err().unwrap();
        assert!(err.is_source_unavailable());
    }

    #[tokio::test]
    async fn test_unreachable_http_source_is_source_unavailable() {
        let fetcher = HttpSourceFetcher::new(Duration::from_millis(200)).unwrap();
        // Port 9 on localhost is not expected to serve HTTP
        let locator = Url::parse("http://127.0.0.1:9/mjpg/video.mjpg").unwrap();
        let err = fetcher.fetch(&locator).await.err().unwrap();
        assert!(err.is_source_unavailable());
    }
}
