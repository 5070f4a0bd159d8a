use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;

use crate::errors::{Result, StreamError};
use crate::source::ByteStream;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Boundary used for every multipart/x-mixed-replace body this server emits.
pub const MULTIPART_BOUNDARY: &str = "frame";

const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

pub fn multipart_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", MULTIPART_BOUNDARY)
}

/// Wrap one JPEG frame as a multipart part (boundary, headers, payload).
pub fn multipart_part(frame: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MULTIPART_BOUNDARY,
        frame.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Cuts complete JPEG images (SOI..EOI) out of an MJPEG byte stream, whatever
/// multipart framing or chunk boundaries the source uses.
pub struct MjpegFrameReader {
    stream: ByteStream,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl MjpegFrameReader {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(100_000),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Next complete frame, or `None` once the stream ends.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.extract_frame()? {
                return Ok(Some(frame));
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }

    fn extract_frame(&mut self) -> Result<Option<Bytes>> {
        let Some(start) = find_marker(&self.buffer, JPEG_SOI, 0) else {
            // Keep a trailing 0xFF, it may be the first half of a split SOI
            let keep = usize::from(self.buffer.last() == Some(&0xFF));
            let discard = self.buffer.len() - keep;
            self.buffer.advance(discard);
            return Ok(None);
        };
        self.buffer.advance(start);

        match find_marker(&self.buffer, JPEG_EOI, JPEG_SOI.len()) {
            Some(end) => Ok(Some(self.buffer.split_to(end + JPEG_EOI.len()).freeze())),
            None if self.buffer.len() > self.max_frame_size => {
                let size = self.buffer.len();
                self.buffer.clear();
                Err(StreamError::transcode(format!(
                    "JPEG frame exceeds maximum size ({} > {} bytes)",
                    size, self.max_frame_size
                )))
            }
            None => Ok(None),
        }
    }
}

fn find_marker(buffer: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if buffer.len() < from + marker.len() {
        return None;
    }
    buffer[from..]
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|position| position + from)
}
