//! Stride-aware random access playback over H.264/HEVC video in MP4
//! containers.
//!
//! The crate has two halves. [`index`] streams an MP4 file through a
//! resumable parser and produces a compact [`VideoIndex`]: per-sample byte
//! offsets and sizes, keyframe positions, codec extradata, and dimensions.
//! [`decode`] takes the index plus a set of desired frame numbers, slices
//! them into keyframe-aligned decode segments, and drives a codec (software
//! libavcodec or NVDEC) through a two-thread state machine that returns
//! exactly the requested frames, in order, as packed RGB24.
//!
//! ```no_run
//! use bytes::Bytes;
//! use strider::{DecoderAutomata, DecoderKind, Mp4IndexBuilder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let video = Bytes::from(std::fs::read("clip.mp4")?);
//!
//! let mut builder = Mp4IndexBuilder::new(video.len() as u64);
//! let mut request = builder.initial_request();
//! while !builder.is_done() {
//!     let start = request.next_offset as usize;
//!     let end = start + request.next_size as usize;
//!     request = builder.feed(&video[start..end]);
//! }
//! let index = builder.video_index()?;
//!
//! let desired = vec![0, 5, 120];
//! let segments = strider::build_segments(&index, video, &desired)?;
//!
//! let mut decoder = DecoderAutomata::new(DecoderKind::Software, 0, 1)?;
//! decoder.initialize(segments, index.metadata_bytes())?;
//! let mut frames = vec![0u8; desired.len() * index.frame_size()];
//! decoder.get_frames(&mut frames, desired.len())?;
//! # Ok(())
//! # }
//! ```

pub mod decode;
pub mod index;

pub use decode::{
    build_segments, DecodeError, DecoderAutomata, DecoderKind, EncodedData, FrameInfo,
    VideoDecoder, VideoFormat,
};
pub use index::{
    slice_into_video_intervals, FeedRequest, IndexError, Mp4IndexBuilder, VideoIndex,
    VideoInterval,
};
