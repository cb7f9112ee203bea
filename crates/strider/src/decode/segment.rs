//! Decode segments: the unit of work handed to the decoder automaton.

use bytes::Bytes;

use crate::index::{slice_into_video_intervals, VideoIndex};

use super::{DecodeError, VideoFormat};

/// A contiguous, keyframe-aligned run of coded samples plus the subset of
/// frames the caller actually wants out of it.
///
/// `encoded_video` is addressed at original absolute file offsets: sample
/// `i` of the segment lives at `encoded_video[sample_offsets[i - start]..]`.
/// In practice callers pass the whole file as a cheaply-cloned [`Bytes`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedData {
    pub encoded_video: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: VideoFormat,
    /// First sample of the segment; always a keyframe.
    pub start_keyframe: u64,
    /// Exclusive upper bound: a keyframe index or the total frame count.
    pub end_keyframe: u64,
    /// Absolute byte offsets of samples `[start_keyframe, end_keyframe)`.
    pub sample_offsets: Vec<u64>,
    /// Byte sizes of samples `[start_keyframe, end_keyframe)`.
    pub sample_sizes: Vec<u64>,
    /// Keyframes within `[start_keyframe, end_keyframe]`, terminated by the
    /// `end_keyframe` sentinel.
    pub keyframes: Vec<u64>,
    /// Monotonically increasing frames to return; never empty.
    pub valid_frames: Vec<u64>,
}

impl EncodedData {
    /// Samples covered by this segment.
    pub fn samples(&self) -> u64 {
        self.end_keyframe - self.start_keyframe
    }

    /// Bytes per decoded RGB24 frame.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Slice `desired_frames` against the index and assemble the decode
/// segments for them. `video` must cover the sample byte ranges of every
/// resulting segment at their absolute offsets (the whole file always
/// does).
pub fn build_segments(
    index: &VideoIndex,
    video: Bytes,
    desired_frames: &[u64],
) -> Result<Vec<EncodedData>, DecodeError> {
    let format = VideoFormat::from_tag(index.format())
        .ok_or_else(|| DecodeError::UnsupportedCodec(index.format().to_owned()))?;

    let intervals = slice_into_video_intervals(index, desired_frames);
    let mut segments = Vec::with_capacity(intervals.len());
    for interval in intervals {
        let start = interval.start_keyframe;
        let end = interval.end_keyframe;

        let mut keyframes: Vec<u64> = index
            .keyframe_indices()
            .iter()
            .copied()
            .filter(|&k| k >= start && k < end)
            .collect();
        keyframes.push(end);

        let sample_offsets = index.sample_offsets()[start as usize..end as usize].to_vec();
        let sample_sizes = index.sample_sizes()[start as usize..end as usize].to_vec();

        // The segment has to be able to address its last sample.
        if let (Some(&last_offset), Some(&last_size)) =
            (sample_offsets.last(), sample_sizes.last())
        {
            if last_offset + last_size > video.len() as u64 {
                return Err(DecodeError::SampleOutOfRange {
                    offset: last_offset,
                    size: last_size,
                    buffer_len: video.len(),
                });
            }
        }

        segments.push(EncodedData {
            encoded_video: video.clone(),
            width: index.frame_width(),
            height: index.frame_height(),
            format,
            start_keyframe: start,
            end_keyframe: end,
            sample_offsets,
            sample_sizes,
            keyframes,
            valid_frames: interval.valid_frames,
        });
    }
    Ok(segments)
}
