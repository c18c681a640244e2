use std::path::PathBuf;

use framestat_runtime::StatsError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error("{} holds no valid frames", .0.display())]
    NoFrames(PathBuf),

    #[error("frame {frame} is not a valid frame of {} (valid: {first}..={last})", path.display())]
    FrameNotFound {
        frame: i64,
        path: PathBuf,
        first: i64,
        last: i64,
    },

    #[error("{} is a raw capture -- only condensed (.fstats) captures can be reported on", .0.display())]
    RawCapture(PathBuf),

    #[error("failed to encode report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
