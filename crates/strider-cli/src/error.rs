use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid frame list: {0}")]
    InvalidFrameList(String),

    #[error("Frame {frame} out of range (video has {frames} frames)")]
    FrameOutOfRange { frame: u64, frames: u64 },

    #[error("Video has no frames")]
    EmptyVideo,

    #[error("Indexing failed: {0}")]
    Index(String),

    #[allow(dead_code)]
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
