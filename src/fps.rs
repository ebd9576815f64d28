/// Rolling frames-per-second counter over whole-second windows.
///
/// Timestamps are milliseconds since the epoch. A sample is produced by the
/// first frame whose second is past the second the window started in; the
/// window then restarts at that frame's timestamp.
#[derive(Debug)]
pub struct FpsCounter {
    window_start_ms: u64,
    frames: u32,
}

impl FpsCounter {
    pub fn new(now_ms: u64) -> Self {
        Self {
            window_start_ms: now_ms,
            frames: 0,
        }
    }

    /// Frames counted since the window started.
    #[cfg(test)]
    pub fn pending(&self) -> u32 {
        self.frames
    }

    /// Count one frame seen at `now_ms`, returning a sample if the window closed.
    pub fn record(&mut self, now_ms: u64) -> Option<f64> {
        self.frames += 1;

        if now_ms / 1000 <= self.window_start_ms / 1000 {
            return None;
        }

        let elapsed = (now_ms - self.window_start_ms) as f64 / 1000.0;
        let fps = f64::from(self.frames) / elapsed;
        self.frames = 0;
        self.window_start_ms = now_ms;
        Some(fps)
    }
}
