//! MP4 parsing and the Video Index.
//!
//! [`Mp4IndexBuilder`] walks an MP4 file in caller-supplied chunks and
//! produces a [`VideoIndex`] describing the video track: where every sample
//! lives in the file, which samples are random-access points, and the codec
//! configuration needed to decode them. [`slice_into_video_intervals`]
//! turns a sparse frame request into keyframe-aligned intervals consistent
//! with that index.

pub mod bits;
pub mod boxes;
mod builder;
mod intervals;
mod video_index;

pub use builder::{FeedRequest, Mp4IndexBuilder};
pub use intervals::{slice_into_video_intervals, VideoInterval};
pub use video_index::VideoIndex;

/// Index-side error type.
///
/// Builder failures are terminal: once `feed` reports an error the builder
/// stays in the error state and `video_index()` keeps returning it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndexError {
    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("EOF in middle of box")]
    TruncatedBox,

    #[error("Reached EOF without being done")]
    EofBeforeComplete,

    #[error("No supported mp4 brands: {0}")]
    UnsupportedBrand(String),

    #[error("Could not find a video trak")]
    NoVideoTrack,

    #[error("Could not find '{0}'")]
    MissingBox(&'static str),

    #[error("'{0}' not supported")]
    Unsupported(&'static str),

    #[error("Unsupported codec tag: {0}")]
    UnsupportedCodecTag(String),

    #[error("malformed mp4: {0}")]
    Malformed(String),

    #[error("index is not complete yet")]
    NotFinished,

    #[error("could not decode video index: {0}")]
    Decode(String),
}
