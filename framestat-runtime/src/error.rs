use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("frame {0} is not a valid frame")]
    InvalidFrame(i64),

    #[error("failed to open capture {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not a stats capture (magic {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported capture version {0}")]
    UnsupportedVersion(u32),

    #[error("corrupt capture: {0}")]
    Corrupt(String),

    #[error("{} is a raw capture -- read it with the raw packet reader", path.display())]
    RawCapture { path: PathBuf },

    #[error("{} is not a raw capture", path.display())]
    NotRawCapture { path: PathBuf },

    #[error("stats thread has stopped")]
    ThreadStopped,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StatsError> = std::result::Result<T, E>;
