use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FfmpegConfig;
use crate::errors::{Result, StreamError};
use crate::mjpeg::MjpegFrameReader;
use crate::segment_store::Segment;
use crate::source::ByteStream;

/// Receives segments from a running segment-mode transcode.
#[async_trait]
pub trait SegmentSink: Send + Sync {
    /// Directory the transcoder writes segment files into. Exists before the job starts.
    fn output_dir(&self) -> &Path;

    async fn on_segment_ready(&self, segment: Segment) -> Result<()>;
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Produce a single still image from the head of `input`.
    async fn transcode_one_frame(&self, input: ByteStream) -> Result<Bytes>;

    /// Run until `input` ends or the future is dropped, reporting each completed segment.
    async fn transcode_to_segments(
        &self,
        input: ByteStream,
        segment_duration: Duration,
        sink: Arc<dyn SegmentSink>,
    ) -> Result<()>;
}

/// Aborts the wrapped task when dropped, so a cancelled transcode stops feeding its child.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct FfmpegTranscoder {
    config: FfmpegConfig,
}

impl FfmpegTranscoder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    fn input_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(), "error".into(),
            "-fflags".into(), "+nobuffer+genpts".into(),
        ];
        if let Some(extra) = &self.config.extra_input_args {
            args.extend(extra.iter().cloned());
        }
        if let Some(format) = &self.config.input_format {
            args.extend(["-f".to_string(), format.clone()]);
        }
        args.extend(["-i".to_string(), "pipe:0".to_string()]);
        args
    }

    fn segment_args(&self, segment_duration: Duration, output_dir: &Path) -> Vec<String> {
        let seconds = format!("{:.3}", segment_duration.as_secs_f64());
        let mut args = self.input_args();
        args.extend([
            "-an".to_string(),
            "-c:v".to_string(), self.config.video_codec.clone(),
            "-preset".to_string(), self.config.preset.clone(),
            "-crf".to_string(), self.config.crf.to_string(),
            "-force_key_frames".to_string(), format!("expr:gte(t,n_forced*{})", seconds),
            "-f".to_string(), "segment".to_string(),
            "-segment_time".to_string(), seconds,
            "-segment_format".to_string(), "mpegts".to_string(),
            "-reset_timestamps".to_string(), "1".to_string(),
            "-segment_list".to_string(), "pipe:1".to_string(),
            "-segment_list_type".to_string(), "csv".to_string(),
            "-segment_list_flags".to_string(), "+live".to_string(),
            output_dir.join("segment_%06d.ts").to_string_lossy().into_owned(),
        ]);
        args
    }

    fn snapshot_args(&self) -> Vec<String> {
        let mut args = self.input_args();
        args.extend([
            "-frames:v".to_string(), "1".to_string(),
            "-f".to_string(), "image2".to_string(),
            "-c:v".to_string(), "mjpeg".to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }

    async fn snapshot_with_ffmpeg(&self, input: ByteStream) -> Result<Bytes> {
        let mut child = Command::new(&self.config.binary)
            .args(self.snapshot_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::transcode(format!("Failed to start {}: {}", self.config.binary, e)))?;

        let stdin = child.stdin.take()
            .ok_or_else(|| StreamError::transcode("Failed to get FFmpeg stdin"))?;
        let mut stdout = child.stdout.take()
            .ok_or_else(|| StreamError::transcode("Failed to get FFmpeg stdout"))?;
        let _pump = AbortOnDrop(tokio::spawn(pump_input(input, stdin)));

        let mut image = Vec::new();
        stdout.read_to_end(&mut image).await?;
        let status = child.wait().await?;

        if !status.success() || image.is_empty() {
            return Err(StreamError::transcode(format!(
                "FFmpeg produced no snapshot (exit status {:?})",
                status.code()
            )));
        }
        Ok(Bytes::from(image))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode_one_frame(&self, input: ByteStream) -> Result<Bytes> {
        if self.config.snapshot_via_ffmpeg {
            return self.snapshot_with_ffmpeg(input).await;
        }

        // MJPEG feeds already carry JPEG frames, cut the first one out directly
        MjpegFrameReader::new(input)
            .next_frame()
            .await?
            .ok_or_else(|| StreamError::transcode("Source ended before a complete frame arrived"))
    }

    async fn transcode_to_segments(
        &self,
        input: ByteStream,
        segment_duration: Duration,
        sink: Arc<dyn SegmentSink>,
    ) -> Result<()> {
        let output_dir = sink.output_dir().to_path_buf();
        info!("Starting FFmpeg segmenter into {:?} ({:?} segments)", output_dir, segment_duration);

        let mut child = Command::new(&self.config.binary)
            .args(self.segment_args(segment_duration, &output_dir))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::transcode(format!("Failed to start {}: {}", self.config.binary, e)))?;

        let stdin = child.stdin.take()
            .ok_or_else(|| StreamError::transcode("Failed to get FFmpeg stdin"))?;
        let stdout = child.stdout.take()
            .ok_or_else(|| StreamError::transcode("Failed to get FFmpeg stdout"))?;
        let _pump = AbortOnDrop(tokio::spawn(pump_input(input, stdin)));

        let _stderr_logger = child.stderr.take().map(|stderr| {
            AbortOnDrop(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("FFmpeg: {}", line);
                }
            }))
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut sequence = 0u64;
        while let Some(line) = lines.next_line().await? {
            match parse_segment_list_line(&line, &output_dir, sequence) {
                Some(segment) => {
                    sequence += 1;
                    if let Err(e) = sink.on_segment_ready(segment).await {
                        warn!("Segment sink rejected segment: {}", e);
                    }
                }
                None => debug!("Ignoring segment list line '{}'", line),
            }
        }

        let status = child.wait().await?;
        if status.success() {
            info!("FFmpeg segmenter finished after {} segment(s)", sequence);
            Ok(())
        } else {
            Err(StreamError::transcode(format!(
                "FFmpeg segmenter exited with status {:?} after {} segment(s)",
                status.code(),
                sequence
            )))
        }
    }
}

async fn pump_input(mut input: ByteStream, mut stdin: ChildStdin) {
    while let Some(chunk) = input.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Source stream failed while feeding FFmpeg: {}", e);
                break;
            }
        };
        if let Err(e) = stdin.write_all(&chunk).await {
            // FFmpeg exits early in snapshot mode, a broken pipe is expected there
            debug!("FFmpeg stdin closed: {}", e);
            return;
        }
    }
    let _ = stdin.shutdown().await;
}

/// Parse one line of ffmpeg's CSV segment list: `segment_000003.ts,12.000000,16.000000`.
fn parse_segment_list_line(line: &str, output_dir: &Path, sequence: u64) -> Option<Segment> {
    let mut fields = line.trim().split(',');
    let file_name = fields.next().filter(|name| !name.is_empty())?;
    let start: f64 = fields.next()?.parse().ok()?;
    let end: f64 = fields.next()?.parse().ok()?;
    if start.is_nan() || end.is_nan() || end < start {
        return None;
    }

    let path = PathBuf::from(file_name);
    let path = if path.is_absolute() { path } else { output_dir.join(path) };

    Some(Segment {
        sequence,
        path,
        duration: Duration::from_secs_f64(end - start),
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mjpeg::multipart_part;
    use futures_util::stream;

    #[test]
    fn test_parse_segment_list_line() {
        let dir = Path::new("/var/recordings/cam1/job");
        let segment = parse_segment_list_line("segment_000003.ts,12.000000,16.000000", dir, 3).unwrap();
        assert_eq!(segment.sequence, 3);
        assert_eq!(segment.path, dir.join("segment_000003.ts"));
        assert_eq!(segment.duration, Duration::from_secs(4));

        assert!(parse_segment_list_line("", dir, 0).is_none());
        assert!(parse_segment_list_line("segment_000001.ts,abc,4.0", dir, 0).is_none());
        assert!(parse_segment_list_line("segment_000001.ts,8.0,4.0", dir, 0).is_none());
    }

    #[test]
    fn test_segment_args_target_output_dir() {
        let transcoder = FfmpegTranscoder::new(FfmpegConfig::default());
        let args = transcoder.segment_args(Duration::from_secs(4), Path::new("/rec/cam1/job"));

        let position = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[position("-segment_time") + 1], "4.000");
        assert_eq!(args[position("-i") + 1], "pipe:0");
        assert_eq!(args[position("-f") + 1], "mpjpeg");
        assert_eq!(args.last().unwrap(), "/rec/cam1/job/segment_%06d.ts");
    }

    #[tokio::test]
    async fn test_one_frame_from_mjpeg_feed() {
        let transcoder = FfmpegTranscoder::new(FfmpegConfig::default());
        let mut first = vec![0xFF, 0xD8];
        first.extend_from_slice(b"first");
        first.extend_from_slice(&[0xFF, 0xD9]);
        let second = [0xFF, 0xD8, 0x01, 0xFF, 0xD9];

        let input: ByteStream = Box::pin(stream::iter(vec![
            Ok(multipart_part(&first)),
            Ok(multipart_part(&second)),
        ]));
        assert_eq!(transcoder.transcode_one_frame(input).await.unwrap(), Bytes::from(first));
    }

    #[tokio::test]
    async fn test_empty_feed_is_transcode_error() {
        let transcoder = FfmpegTranscoder::new(FfmpegConfig::default());
        let input: ByteStream = Box::pin(stream::empty());
        assert!(matches!(
            transcoder.transcode_one_frame(input).await,
            Err(StreamError::Transcode { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_transcode_error() {
        let transcoder = FfmpegTranscoder::new(FfmpegConfig {
            binary: "/nonexistent/ffmpeg".to_string(),
            snapshot_via_ffmpeg: true,
            ..FfmpegConfig::default()
        });
        let input: ByteStream = Box::pin(stream::empty());
        assert!(matches!(
            transcoder.transcode_one_frame(input).await,
            Err(StreamError::Transcode { .. })
        ));
    }
}
