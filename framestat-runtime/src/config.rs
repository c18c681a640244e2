//! Engine settings with environment overrides.
//!
//! `FRAMESTAT_HISTORY_FRAMES`, `FRAMESTAT_FRAME_SLOP` and
//! `FRAMESTAT_COMPRESS` override the defaults when set and parseable.

/// Frames kept behind the newest finished frame.
pub const DEFAULT_HISTORY_FRAMES: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsConfig {
    pub history_frames: u32,
    /// Frame counters must pass this value before skipped frames are
    /// marked bad.
    pub frame_slop: i64,
    /// Deflate frame blocks in capture files.
    pub compress: bool,
    /// Platform name written into capture headers.
    pub platform: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            history_frames: DEFAULT_HISTORY_FRAMES,
            frame_slop: 0,
            compress: true,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

impl StatsConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("FRAMESTAT_HISTORY_FRAMES") {
            config.history_frames = v;
        }
        if let Some(v) = env_parse("FRAMESTAT_FRAME_SLOP") {
            config.frame_slop = v;
        }
        if let Ok(v) = std::env::var("FRAMESTAT_COMPRESS") {
            config.compress = !matches!(v.as_str(), "0" | "false" | "off" | "no");
        }
        config
    }

    pub fn with_history_frames(mut self, frames: u32) -> Self {
        self.history_frames = frames;
        self
    }

    pub fn with_frame_slop(mut self, slop: i64) -> Self {
        self.frame_slop = slop;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StatsConfig::default();
        assert_eq!(config.history_frames, DEFAULT_HISTORY_FRAMES);
        assert_eq!(config.frame_slop, 0);
        assert!(config.compress);
        assert!(!config.platform.is_empty());
    }

    #[test]
    fn builders_override() {
        let config = StatsConfig::default()
            .with_history_frames(3)
            .with_frame_slop(2)
            .with_compression(false);
        assert_eq!(config.history_frames, 3);
        assert_eq!(config.frame_slop, 2);
        assert!(!config.compress);
    }
}
