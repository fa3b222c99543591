use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use super::stub::frame_interval;
use super::SourceStats;
use crate::config::StreamSettings;
use crate::frame::Frame;
use crate::now_ms;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// HTTP frame source for cameras exposing MJPEG streams or single-JPEG
/// snapshot endpoints.
pub struct MjpegSource {
    settings: StreamSettings,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegSource {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            stream: None,
            last_frame_at: None,
            connected_at: None,
            frame_count: 0,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        let response = ureq::get(&self.settings.url)
            .timeout(Duration::from_secs(10))
            .call()
            .context("connect to http stream")?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(Box::new(reader))));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        self.connected_at = Some(Instant::now());
        log::info!("MjpegSource: connected to {}", self.settings.url);
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        let url = self.settings.url.clone();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http source not connected; call connect() first"))?;
        let min_interval = frame_interval(self.settings.target_fps);

        let jpeg_bytes = match stream {
            // The camera pushes at its own rate; drop frames until the
            // configured interval has elapsed.
            HttpStream::Mjpeg(stream) => loop {
                let bytes = stream.read_next_jpeg()?;
                let due = self
                    .last_frame_at
                    .map_or(true, |last| last.elapsed() >= min_interval);
                if due {
                    break bytes;
                }
            },
            // Snapshot endpoints are polled: wait out the remaining interval
            // instead of fetching and discarding.
            HttpStream::SingleJpeg => {
                std::thread::sleep(snapshot_delay(self.last_frame_at, min_interval));
                fetch_single_jpeg(&url)?
            }
        };

        let (pixels, width, height) = decode_jpeg(&jpeg_bytes)?;
        let seq = self.frame_count;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Ok(Frame::new(pixels, width, height, seq, now_ms()?))
    }

    pub fn is_healthy(&self) -> bool {
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= health_grace(self.settings.target_fps)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.settings.url.clone(),
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .timeout(Duration::from_secs(10))
        .call()
        .context("fetch jpeg snapshot")?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot body")?;
    if bytes.is_empty() {
        return Err(anyhow!("jpeg snapshot was empty"));
    }
    Ok(bytes)
}

/// Locate a complete JPEG (SOI..EOI) in the buffer.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end_rel = buffer[start..].windows(2).position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + end_rel + 2))
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg frame")?;
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok((rgb.into_raw(), width, height))
}

/// How long to wait before the next snapshot fetch.
fn snapshot_delay(last_frame_at: Option<Instant>, min_interval: Duration) -> Duration {
    match last_frame_at {
        Some(last) => min_interval.saturating_sub(last.elapsed()),
        None => Duration::ZERO,
    }
}

fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_bounds_found_across_garbage_prefix() {
        let mut buf = vec![0x00, 0x01, 0x02];
        buf.extend_from_slice(&[0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]);
        buf.extend_from_slice(&[0x33, 0x44]);

        let (start, end) = find_jpeg_bounds(&buf).expect("bounds");
        assert_eq!(&buf[start..start + 2], &[0xFF, 0xD8]);
        assert_eq!(&buf[end - 2..end], &[0xFF, 0xD9]);
    }

    #[test]
    fn incomplete_jpeg_yields_no_bounds() {
        let buf = [0xFF, 0xD8, 0xAA, 0xBB];
        assert!(find_jpeg_bounds(&buf).is_none());
    }

    #[test]
    fn snapshot_delay_covers_the_remaining_interval() {
        let interval = Duration::from_millis(200);
        assert_eq!(snapshot_delay(None, interval), Duration::ZERO);

        // A frame taken just now leaves most of the interval to wait out.
        let delay = snapshot_delay(Some(Instant::now()), interval);
        assert!(delay > Duration::from_millis(100));
        assert!(delay <= interval);
    }
}
