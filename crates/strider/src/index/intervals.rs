//! Slice a sparse frame request into keyframe-aligned decode intervals.

use super::VideoIndex;

/// One decode interval: the half-open sample range `[start_keyframe,
/// end_keyframe)` that must be fed to a decoder so that every frame in
/// `valid_frames` comes out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInterval {
    /// Sample index of the random-access point the interval starts on.
    pub start_keyframe: u64,
    /// Exclusive upper bound: the next keyframe after the last desired
    /// frame, or `index.frames()`.
    pub end_keyframe: u64,
    /// The subset of `[start_keyframe, end_keyframe)` the caller wants.
    pub valid_frames: Vec<u64>,
}

/// Partition `desired_frames` into decode intervals consistent with the
/// index's keyframe structure.
///
/// A new interval starts whenever the walk crosses a keyframe boundary and
/// either a whole keyframe was skipped or the bytes between the previous
/// interval's last sample and the new keyframe are not adjacent in the
/// file. Non-adjacent bytes belong to other media and must never reach the
/// codec.
///
/// `desired_frames` must be non-empty, strictly increasing, and within
/// `[0, index.frames())`; violations panic.
pub fn slice_into_video_intervals(index: &VideoIndex, desired_frames: &[u64]) -> Vec<VideoInterval> {
    assert!(!desired_frames.is_empty(), "no frames requested");

    let frames = index.frames();
    let offsets = index.sample_offsets();
    let sizes = index.sample_sizes();

    // Keyframes plus a sentinel boundary at end of stream.
    let mut boundaries: Vec<u64> = index.keyframe_indices().to_vec();
    boundaries.push(frames);
    assert!(boundaries.len() >= 2, "index has no samples");

    let mut intervals = Vec::new();
    let mut start_idx = 0usize;
    let mut end_idx = 1usize;
    let mut next_keyframe = boundaries[end_idx];
    let mut valid_frames: Vec<u64> = Vec::new();
    let mut prev_frame = None;

    for &frame in desired_frames {
        assert!(frame < frames, "frame {frame} out of range");
        assert!(
            prev_frame.is_none_or(|p| p < frame),
            "desired frames must be strictly increasing"
        );
        prev_frame = Some(frame);

        if frame >= next_keyframe {
            // Crossing a keyframe boundary; `next_keyframe < frames` here
            // because `frame < frames`.
            let last = (next_keyframe - 1) as usize;
            let adjacent =
                offsets[last] + sizes[last] == offsets[next_keyframe as usize];

            end_idx += 1;
            next_keyframe = boundaries[end_idx];

            if frame >= next_keyframe || !adjacent {
                // Skipped a keyframe or the data is spliced: close the
                // current interval and restart at the keyframe covering
                // `frame`.
                if !valid_frames.is_empty() {
                    intervals.push(VideoInterval {
                        start_keyframe: boundaries[start_idx],
                        end_keyframe: boundaries[end_idx - 1],
                        valid_frames: std::mem::take(&mut valid_frames),
                    });
                }
                while frame >= boundaries[end_idx] {
                    end_idx += 1;
                }
                start_idx = end_idx - 1;
                next_keyframe = boundaries[end_idx];
            }
        }
        valid_frames.push(frame);
    }

    intervals.push(VideoInterval {
        start_keyframe: boundaries[start_idx],
        end_keyframe: boundaries[end_idx],
        valid_frames,
    });
    intervals
}
