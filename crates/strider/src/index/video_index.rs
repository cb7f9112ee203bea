//! The Video Index value object and its binary codec.
//!
//! The index is the only persisted artifact of this crate: a compact,
//! versioned, tagged-field (protobuf) encoding that can be cached next to
//! the source MP4 and rebuilt into an identical value later.

use prost::Message;

use super::IndexError;

/// Current wire version. Bump when the field set changes incompatibly.
const INDEX_VERSION: u32 = 1;

/// Per-sample layout of the video track of one MP4 file.
///
/// Immutable after construction. `sample_offsets[i]` is the absolute byte
/// offset of coded frame `i` in the source file and `sample_sizes[i]` its
/// length; `keyframe_indices` lists the samples that are random-access
/// points, always starting with sample 0.
#[derive(Clone, PartialEq, Message)]
pub struct VideoIndex {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(uint32, tag = "2")]
    timescale: u32,
    #[prost(uint64, tag = "3")]
    duration: u64,
    #[prost(uint32, tag = "4")]
    frame_width: u32,
    #[prost(uint32, tag = "5")]
    frame_height: u32,
    /// Codec tag from the sample description, e.g. `avc1` or `hev1`.
    #[prost(string, tag = "6")]
    format: String,
    #[prost(uint64, repeated, tag = "7")]
    sample_offsets: Vec<u64>,
    #[prost(uint64, repeated, tag = "8")]
    sample_sizes: Vec<u64>,
    #[prost(uint64, repeated, tag = "9")]
    keyframe_indices: Vec<u64>,
    /// Codec-private extradata: the payload of the `avcC`/`hvcC` box.
    #[prost(bytes = "vec", tag = "10")]
    metadata_bytes: Vec<u8>,
}

impl VideoIndex {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timescale: u32,
        duration: u64,
        frame_width: u32,
        frame_height: u32,
        format: String,
        sample_offsets: Vec<u64>,
        sample_sizes: Vec<u64>,
        mut keyframe_indices: Vec<u64>,
        metadata_bytes: Vec<u8>,
    ) -> Self {
        assert_eq!(
            sample_offsets.len(),
            sample_sizes.len(),
            "offset and size tables must pair up"
        );
        // Normalize: decoding always starts at sample 0, whatever the file
        // claimed.
        if !sample_sizes.is_empty() && keyframe_indices.first() != Some(&0) {
            keyframe_indices.insert(0, 0);
        }
        Self {
            version: INDEX_VERSION,
            timescale,
            duration,
            frame_width,
            frame_height,
            format,
            sample_offsets,
            sample_sizes,
            keyframe_indices,
            metadata_bytes,
        }
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn frame_width(&self) -> u32 {
        self.frame_width
    }

    pub fn frame_height(&self) -> u32 {
        self.frame_height
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn sample_offsets(&self) -> &[u64] {
        &self.sample_offsets
    }

    pub fn sample_sizes(&self) -> &[u64] {
        &self.sample_sizes
    }

    pub fn keyframe_indices(&self) -> &[u64] {
        &self.keyframe_indices
    }

    pub fn metadata_bytes(&self) -> &[u8] {
        &self.metadata_bytes
    }

    /// Number of samples (coded frames) in the track.
    pub fn frames(&self) -> u64 {
        self.sample_sizes.len() as u64
    }

    /// Bytes per decoded RGB24 frame.
    pub fn frame_size(&self) -> usize {
        self.frame_width as usize * self.frame_height as usize * 3
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, IndexError> {
        let index = Self::decode(data).map_err(|e| IndexError::Decode(e.to_string()))?;
        index.validate()?;
        Ok(index)
    }

    fn validate(&self) -> Result<(), IndexError> {
        if self.version == 0 || self.version > INDEX_VERSION {
            return Err(IndexError::Decode(format!(
                "unsupported index version {}",
                self.version
            )));
        }
        if self.sample_offsets.len() != self.sample_sizes.len() {
            return Err(IndexError::Decode(format!(
                "{} sample offsets but {} sizes",
                self.sample_offsets.len(),
                self.sample_sizes.len()
            )));
        }
        let frames = self.frames();
        let mut prev = None;
        for &k in &self.keyframe_indices {
            if k >= frames {
                return Err(IndexError::Decode(format!(
                    "keyframe index {k} outside {frames} frames"
                )));
            }
            if prev.is_some_and(|p| p >= k) {
                return Err(IndexError::Decode(
                    "keyframe indices not strictly increasing".into(),
                ));
            }
            prev = Some(k);
        }
        if frames > 0 && self.keyframe_indices.first() != Some(&0) {
            return Err(IndexError::Decode("first keyframe is not sample 0".into()));
        }
        Ok(())
    }
}
