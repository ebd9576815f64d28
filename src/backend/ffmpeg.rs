//! FFmpeg-backed collaborators: demuxer, video decoder, BGR24 resampler and
//! MJPEG snapshot encoder.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use ffmpeg_next::{
    codec::{self, decoder::Video as VideoDecoderFFmpeg, encoder::Video as VideoEncoderFFmpeg},
    ffi,
    format::{context::Input as InputContext, Pixel},
    media::Type,
    software::scaling::{context::Context as ScalerContext, flag::Flags as ScalerFlags},
    util::frame::video::Video as VideoFrame,
    Dictionary, Packet, Rational,
};
use tracing::{debug, info};

use crate::capture::{
    self, CaptureLoop, CaptureSummary, Decoder, Demuxer, JpegEncoder, Resampler, SystemClock,
};
use crate::cli::Config;
use crate::diagnostics::ProcessProbe;
use crate::snapshot::persist;

/// (format, src width, src height, dst width, dst height)
type ScalerKey = (Pixel, u32, u32, u32, u32);

/// Back-off between reads of a source that reported EAGAIN.
const RETRY_DELAY: Duration = Duration::from_millis(10);

pub fn capture(config: &Config, stop: &Arc<AtomicBool>) -> Result<CaptureSummary> {
    ffmpeg_next::init().context("failed to initialise FFmpeg")?;
    ffmpeg_next::log::set_level(ffmpeg_next::log::Level::Error);

    let mut input = Input::open(&config.stream_uri, Arc::clone(stop))?;
    let mut decoder = VideoDecoder::open(&input)?;

    let mut capture = CaptureLoop::new(
        &config.img_folder,
        BgrResampler::default(),
        MjpegEncoder::default(),
        SystemClock,
    )
    .with_probe(config.diagnostics_every.map(ProcessProbe::new));

    let summary = capture::run(&mut input, &mut decoder, &mut capture, stop, config.max_frames)?;

    info!("releasing all the resources");
    Ok(summary)
}

/// Demuxer over an FFmpeg input context.
///
/// Blocking I/O inside FFmpeg polls `stop`, so raising it aborts a stalled
/// open or read instead of waiting for the network.
pub struct Input {
    input: InputContext,
    video_stream: usize,
    stop: Arc<AtomicBool>,
}

impl Input {
    pub fn open(uri: &str, stop: Arc<AtomicBool>) -> Result<Self> {
        info!(uri, "opening the input and loading format (container) header");
        let interrupt = Arc::clone(&stop);
        let input = ffmpeg_next::format::input_with_interrupt(&uri, move || {
            interrupt.load(Ordering::SeqCst)
        })
        .with_context(|| format!("could not open input '{uri}'"))?;

        info!(
            format = input.format().name(),
            duration_us = input.duration(),
            streams = input.nb_streams(),
            "input opened"
        );

        let mut video_stream = None;
        for stream in input.streams() {
            let parameters = stream.parameters();
            let medium = parameters.medium();
            let codec = ffmpeg_next::decoder::find(parameters.id());
            let details = StreamDetails::of(&parameters);
            info!(
                index = stream.index(),
                ?medium,
                codec = codec.as_ref().map(|c| c.name()).unwrap_or("unknown"),
                time_base = ?stream.time_base(),
                frame_rate = ?stream.rate(),
                start_time = stream.start_time(),
                duration = stream.duration(),
                bit_rate = details.bit_rate,
                "stream"
            );
            match medium {
                Type::Video => info!(
                    index = stream.index(),
                    width = details.width,
                    height = details.height,
                    "video stream resolution"
                ),
                Type::Audio => info!(
                    index = stream.index(),
                    channels = details.channels,
                    sample_rate = details.sample_rate,
                    "audio stream layout"
                ),
                _ => {}
            }

            if medium == Type::Video && video_stream.is_none() {
                video_stream = Some(stream.index());
            }
        }

        let video_stream = video_stream.context("input has no video stream")?;
        info!(index = video_stream, "selected video stream");

        Ok(Self {
            input,
            video_stream,
            stop,
        })
    }
}

/// Codec parameters the safe wrapper does not expose.
struct StreamDetails {
    width: i32,
    height: i32,
    channels: i32,
    sample_rate: i32,
    bit_rate: i64,
}

impl StreamDetails {
    fn of(parameters: &codec::Parameters) -> Self {
        // SAFETY: the pointer comes from a live stream owned by the open input
        // and is only read here.
        unsafe {
            let ptr = parameters.as_ptr();
            Self {
                width: (*ptr).width,
                height: (*ptr).height,
                channels: (*ptr).ch_layout.nb_channels,
                sample_rate: (*ptr).sample_rate,
                bit_rate: (*ptr).bit_rate,
            }
        }
    }
}

impl Demuxer for Input {
    type Packet = Packet;

    fn video_stream(&self) -> usize {
        self.video_stream
    }

    fn read_packet(&mut self) -> Result<Option<(usize, Packet)>> {
        let mut packet = Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) => return Ok(Some((packet.stream(), packet))),
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffi::EAGAIN => {
                    if self.stop.load(Ordering::SeqCst) {
                        anyhow::bail!("read interrupted");
                    }
                    thread::sleep(RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Decoder for the selected video stream.
pub struct VideoDecoder {
    decoder: VideoDecoderFFmpeg,
}

impl VideoDecoder {
    pub fn open(input: &Input) -> Result<Self> {
        let stream = input
            .input
            .stream(input.video_stream)
            .context("video stream disappeared")?;
        let parameters = stream.parameters();

        let codec = ffmpeg_next::decoder::find(parameters.id())
            .with_context(|| format!("unsupported codec {:?}", parameters.id()))?;

        let context = codec::context::Context::from_parameters(parameters)
            .context("failed to copy codec params to codec context")?;
        let decoder = context
            .decoder()
            .video()
            .with_context(|| format!("failed to open {} decoder", codec.name()))?;

        info!(
            codec = codec.name(),
            width = decoder.width(),
            height = decoder.height(),
            pixel_format = ?decoder.format(),
            "video decoder ready"
        );

        Ok(Self { decoder })
    }
}

impl Decoder for VideoDecoder {
    type Packet = Packet;
    type Frame = VideoFrame;

    fn dimensions(&self) -> (u32, u32) {
        (self.decoder.width(), self.decoder.height())
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self.decoder.send_packet(packet)?;
        Ok(())
    }

    fn send_eof(&mut self) -> Result<()> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg_next::Error::Eof) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn receive_frame(&mut self) -> Result<Option<VideoFrame>> {
        let mut frame = VideoFrame::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(frame)),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffi::EAGAIN => Ok(None),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

struct ScalerState {
    context: ScalerContext,
    key: ScalerKey,
    output: VideoFrame,
}

impl ScalerState {
    fn new(key: ScalerKey, dst_format: Pixel) -> Result<Self> {
        let (src_format, src_width, src_height, dst_width, dst_height) = key;
        let context = ScalerContext::get(
            src_format,
            src_width,
            src_height,
            dst_format,
            dst_width,
            dst_height,
            ScalerFlags::BILINEAR,
        )
        .with_context(|| format!("failed to create scaler {src_format:?} -> {dst_format:?}"))?;
        debug!(
            ?src_format,
            ?dst_format,
            src_width,
            src_height,
            dst_width,
            dst_height,
            "scaler created"
        );

        Ok(Self {
            context,
            key,
            output: VideoFrame::empty(),
        })
    }

    fn run(&mut self, frame: &VideoFrame) -> Result<&VideoFrame> {
        self.context.run(frame, &mut self.output).context("scaling failed")?;
        Ok(&self.output)
    }
}

/// Keeps one scaling context, rebuilt whenever the key changes.
fn scaler_for(
    slot: &mut Option<ScalerState>,
    key: ScalerKey,
    dst_format: Pixel,
) -> Result<&mut ScalerState> {
    if slot.as_ref().map_or(true, |s| s.key != key) {
        *slot = Some(ScalerState::new(key, dst_format)?);
    }
    slot.as_mut().context("scaler not initialized")
}

/// Converts decoded frames to packed BGR24 at the codec context size.
#[derive(Default)]
pub struct BgrResampler {
    scaler: Option<ScalerState>,
}

impl Resampler<VideoFrame> for BgrResampler {
    fn to_bgr24(
        &mut self,
        frame: &VideoFrame,
        width: u32,
        height: u32,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let key = (frame.format(), frame.width(), frame.height(), width, height);
        let bgr = scaler_for(&mut self.scaler, key, Pixel::BGR24)?.run(frame)?;

        // drop the per-row padding FFmpeg adds to each line
        let row = width as usize * 3;
        let stride = bgr.stride(0);
        let data = bgr.data(0);
        out.clear();
        out.reserve(row * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            out.extend_from_slice(&data[start..start + row]);
        }
        Ok(())
    }
}

struct EncoderState {
    encoder: VideoEncoderFFmpeg,
    size: (u32, u32),
    next_pts: i64,
}

impl EncoderState {
    fn new(width: u32, height: u32) -> Result<Self> {
        let codec =
            ffmpeg_next::encoder::find(codec::Id::MJPEG).context("could not find MJPEG encoder")?;

        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("failed to allocate MJPEG encoder context")?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(Pixel::YUVJ420P);
        encoder.set_time_base(Rational::new(1, 25));

        let encoder = encoder
            .open_with(Dictionary::new())
            .context("could not open MJPEG encoder")?;

        Ok(Self {
            encoder,
            size: (width, height),
            next_pts: 0,
        })
    }
}

/// Encodes single frames as baseline JPEG files through FFmpeg's MJPEG encoder.
#[derive(Default)]
pub struct MjpegEncoder {
    scaler: Option<ScalerState>,
    state: Option<EncoderState>,
}

impl JpegEncoder<VideoFrame> for MjpegEncoder {
    fn write_jpeg(&mut self, frame: &VideoFrame, path: &Path) -> Result<()> {
        let (width, height) = (frame.width(), frame.height());

        if self.state.as_ref().map_or(true, |s| s.size != (width, height)) {
            self.state = Some(EncoderState::new(width, height)?);
        }
        let state = self.state.as_mut().context("encoder not initialized")?;

        let key = (frame.format(), width, height, width, height);
        let scaler = scaler_for(&mut self.scaler, key, Pixel::YUVJ420P)?;
        let yuv = scaler.run(frame)?;
        let mut yuv = yuv.clone();
        yuv.set_pts(Some(state.next_pts));
        state.next_pts += 1;

        state
            .encoder
            .send_frame(&yuv)
            .context("could not send frame to encoder")?;
        let mut packet = Packet::empty();
        state
            .encoder
            .receive_packet(&mut packet)
            .context("could not receive packet from encoder")?;

        let data = packet.data().context("encoder produced an empty packet")?;
        persist(path, &[data])?;
        Ok(())
    }
}
