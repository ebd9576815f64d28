#[cfg(feature = "ffmpeg")]
mod ffmpeg;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::capture::CaptureSummary;
use crate::cli::Config;

/// Open `config.stream_uri` with the compiled-in media backend and capture
/// until the stream ends, `stop` is raised or the frame limit is hit.
pub fn capture(config: &Config, stop: &Arc<AtomicBool>) -> anyhow::Result<CaptureSummary> {
    #[cfg(feature = "ffmpeg")]
    {
        ffmpeg::capture(config, stop)
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        let _ = (config, stop);
        anyhow::bail!("No media backend compiled in. Rebuild with the `ffmpeg` feature enabled.")
    }
}
