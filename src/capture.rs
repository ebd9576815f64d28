//! The capture driver: pulls packets from a [`Demuxer`], feeds the video
//! stream to a [`Decoder`] and hands every decoded frame to a
//! [`CaptureLoop`], which snapshots it as JPEG + BMP and keeps FPS.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::bmp;
use crate::diagnostics::ProcessProbe;
use crate::fps::FpsCounter;
use crate::snapshot::SnapshotNamer;

/// Splits the input into compressed packets tagged with their stream index.
pub trait Demuxer {
    type Packet;

    /// Index of the stream the decoder was opened for.
    fn video_stream(&self) -> usize;

    /// Next packet in file order, `None` at end of stream.
    fn read_packet(&mut self) -> Result<Option<(usize, Self::Packet)>>;
}

/// Turns packets of one stream into raw frames.
pub trait Decoder {
    type Packet;
    type Frame;

    /// Coded width and height from the codec context.
    fn dimensions(&self) -> (u32, u32);

    fn send_packet(&mut self, packet: &Self::Packet) -> Result<()>;

    /// Signal end of input so buffered frames can be drained.
    fn send_eof(&mut self) -> Result<()>;

    /// Next decoded frame, `None` when the decoder needs more input or is drained.
    fn receive_frame(&mut self) -> Result<Option<Self::Frame>>;
}

/// Converts a decoded frame to packed BGR24.
pub trait Resampler<F> {
    /// Replace the contents of `out` with exactly `width * height * 3` bytes.
    fn to_bgr24(&mut self, frame: &F, width: u32, height: u32, out: &mut Vec<u8>)
        -> Result<()>;
}

/// Serializes one decoded frame as a JPEG file.
pub trait JpegEncoder<F> {
    fn write_jpeg(&mut self, frame: &F, path: &Path) -> Result<()>;
}

pub trait Clock {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CaptureStats {
    pub frames: u64,
    pub jpeg_written: u64,
    pub jpeg_failed: u64,
    pub bitmap_written: u64,
    pub bitmap_failed: u64,
    pub last_fps: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    FrameLimit,
    Interrupted,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureSummary {
    pub reason: StopReason,
    pub stats: CaptureStats,
}

/// Per-run capture state: snapshot naming, FPS window, the conversion
/// collaborators and the BGR scratch buffer reused across frames.
pub struct CaptureLoop<R, J, C = SystemClock> {
    resampler: R,
    jpeg: J,
    clock: C,
    namer: SnapshotNamer,
    fps: FpsCounter,
    scratch: Vec<u8>,
    probe: Option<ProcessProbe>,
    stats: CaptureStats,
}

impl<R, J, C: Clock> CaptureLoop<R, J, C> {
    pub fn new(img_folder: impl Into<PathBuf>, resampler: R, jpeg: J, clock: C) -> Self {
        let fps = FpsCounter::new(clock.now_ms());
        Self {
            resampler,
            jpeg,
            clock,
            namer: SnapshotNamer::new(img_folder),
            fps,
            scratch: Vec::new(),
            probe: None,
            stats: CaptureStats::default(),
        }
    }

    pub fn with_probe(mut self, probe: Option<ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Snapshot one frame and update the FPS window.
    ///
    /// Snapshot failures are logged and counted, never returned: a missed
    /// still must not stop a live capture. Returns the FPS sample if this
    /// frame closed a window.
    pub fn on_frame<F>(&mut self, frame: &F, width: u32, height: u32) -> Option<f64>
    where
        R: Resampler<F>,
        J: JpegEncoder<F>,
    {
        let now = self.clock.now_ms();
        let paths = self.namer.next(now);

        match self.jpeg.write_jpeg(frame, &paths.jpeg) {
            Ok(()) => self.stats.jpeg_written += 1,
            Err(e) => {
                self.stats.jpeg_failed += 1;
                warn!(path = %paths.jpeg.display(), "failed to save JPEG snapshot: {e:#}");
            }
        }

        match self.save_bitmap(frame, width, height, &paths.bitmap) {
            Ok(()) => self.stats.bitmap_written += 1,
            Err(e) => {
                self.stats.bitmap_failed += 1;
                warn!(path = %paths.bitmap.display(), "failed to save BMP snapshot: {e:#}");
            }
        }

        self.stats.frames += 1;
        if let Some(probe) = &self.probe {
            probe.on_frame(self.stats.frames);
        }

        let sample = self.fps.record(now);
        if let Some(fps) = sample {
            info!("FPS: {fps:.2}");
            self.stats.last_fps = Some(fps);
        }
        sample
    }

    fn save_bitmap<F>(&mut self, frame: &F, width: u32, height: u32, path: &Path) -> Result<()>
    where
        R: Resampler<F>,
    {
        self.resampler
            .to_bgr24(frame, width, height, &mut self.scratch)
            .context("pixel format conversion failed")?;
        bmp::write_bitmap(path, &self.scratch, width, height)?;
        Ok(())
    }
}

/// Pump packets until the source ends, `stop` is raised or `max_frames`
/// frames were captured.
///
/// Read and decode errors end the run with `Err`; snapshot errors do not.
/// At end of stream the decoder is flushed so buffered frames are captured too.
pub fn run<D, K, R, J, C>(
    demuxer: &mut D,
    decoder: &mut K,
    capture: &mut CaptureLoop<R, J, C>,
    stop: &AtomicBool,
    max_frames: Option<u64>,
) -> Result<CaptureSummary>
where
    D: Demuxer,
    K: Decoder<Packet = D::Packet>,
    R: Resampler<K::Frame>,
    J: JpegEncoder<K::Frame>,
    C: Clock,
{
    let video_stream = demuxer.video_stream();

    loop {
        if stop.load(Ordering::SeqCst) {
            info!("capture interrupted");
            return Ok(summary(StopReason::Interrupted, capture.stats()));
        }

        // a raised stop flag aborts a blocked read, which surfaces as an error
        let next = match demuxer.read_packet() {
            Ok(next) => next,
            Err(e) if stop.load(Ordering::SeqCst) => {
                info!("capture interrupted: {e:#}");
                return Ok(summary(StopReason::Interrupted, capture.stats()));
            }
            Err(e) => return Err(e.context("failed to read packet from source")),
        };
        let Some((stream, packet)) = next else {
            break;
        };
        if stream != video_stream {
            continue;
        }

        decoder
            .send_packet(&packet)
            .context("error while sending a packet to the decoder")?;
        if drain(decoder, capture, max_frames)? {
            return Ok(summary(StopReason::FrameLimit, capture.stats()));
        }
    }

    debug!("end of stream, flushing decoder");
    decoder.send_eof().context("failed to flush the decoder")?;
    if drain(decoder, capture, max_frames)? {
        return Ok(summary(StopReason::FrameLimit, capture.stats()));
    }
    Ok(summary(StopReason::EndOfStream, capture.stats()))
}

fn summary(reason: StopReason, stats: CaptureStats) -> CaptureSummary {
    CaptureSummary { reason, stats }
}

/// Hand every ready frame to `capture`; `true` once the frame limit is hit.
fn drain<K, R, J, C>(
    decoder: &mut K,
    capture: &mut CaptureLoop<R, J, C>,
    max_frames: Option<u64>,
) -> Result<bool>
where
    K: Decoder,
    R: Resampler<K::Frame>,
    J: JpegEncoder<K::Frame>,
    C: Clock,
{
    while let Some(frame) = decoder
        .receive_frame()
        .context("error while receiving a frame from the decoder")?
    {
        let (width, height) = decoder.dimensions();
        capture.on_frame(&frame, width, height);

        if max_frames.is_some_and(|max| capture.stats().frames >= max) {
            info!(frames = capture.stats().frames, "frame limit reached");
            return Ok(true);
        }
    }
    Ok(false)
}
