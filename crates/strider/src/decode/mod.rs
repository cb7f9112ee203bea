//! Decoding: codec adapters and the decoder automaton.
//!
//! A [`VideoDecoder`] hides the difference between software libavcodec and
//! NVDEC behind a feed/receive-style contract. [`DecoderAutomata`] owns one
//! adapter and runs the two-thread protocol that turns decode segments into
//! exactly the frames a caller requested.

pub mod annexb;
mod automata;
mod nvdec;
mod segment;
mod software;

pub use automata::DecoderAutomata;
pub use segment::{build_segments, EncodedData};

/// Decode-side error type.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported video codec: {0}. Supported codecs are: h264, hevc/h265")]
    UnsupportedCodec(String),

    #[error("could not find decoder '{0}'")]
    DecoderNotFound(String),

    #[error("could not open decoder: {0}")]
    DecoderOpen(String),

    #[error("invalid codec extradata: {0}")]
    InvalidExtradata(String),

    #[error("malformed sample: {0}")]
    MalformedSample(String),

    #[error("send packet failed: {0}")]
    SendPacket(String),

    #[error("receive frame failed: {0}")]
    ReceiveFrame(String),

    #[error("failed to initialize scaler: {0}")]
    ScalerInit(String),

    #[error("pixel conversion failed: {0}")]
    Scale(String),

    #[error("no decoded frame buffered")]
    NoFrameBuffered,

    #[error("decoded frame ring is full")]
    OutputRingFull,

    #[error("output buffer holds {got} bytes but the frame needs {needed}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("sample at {offset}+{size} lies outside the {buffer_len}-byte encoded buffer")]
    SampleOutOfRange {
        offset: u64,
        size: u64,
        buffer_len: usize,
    },

    #[error("decoder is not configured")]
    NotConfigured,

    #[error("decoder feeder failed: {0}")]
    Feeder(String),
}

/// Codec family carried by a segment, derived from the MP4 codec tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    H264,
    Hevc,
}

impl VideoFormat {
    /// Map an MP4 sample-entry tag (or loose codec name) to a format.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "avc1" | "avc3" | "h264" => Some(VideoFormat::H264),
            "hev1" | "hvc1" | "hevc" | "h265" => Some(VideoFormat::Hevc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoFormat::H264 => "h264",
            VideoFormat::Hevc => "hevc",
        }
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream parameters handed to [`VideoDecoder::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: VideoFormat,
}

impl FrameInfo {
    /// Bytes per decoded RGB24 frame.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Uniform contract over the software and hardware decoders.
///
/// All methods are driven by the decoder automaton, which serializes access
/// from its two threads; implementations do not need internal locking.
pub trait VideoDecoder: Send {
    /// (Re)initialize for a stream. May be called repeatedly; previous
    /// state is discarded.
    fn configure(&mut self, info: &FrameInfo, extradata: &[u8]) -> Result<(), DecodeError>;

    /// Push one coded sample. An empty `packet` signals end of stream and
    /// drains the codec's delay queue. `discontinuity` resets the codec
    /// between unrelated segments without reconfiguring.
    fn feed(&mut self, packet: &[u8], keyframe: bool, discontinuity: bool)
        -> Result<(), DecodeError>;

    /// Drop the oldest decoded frame, if any.
    fn discard_frame(&mut self) -> Result<(), DecodeError>;

    /// Pop the oldest decoded frame, convert to packed RGB24, and write it
    /// to `out`.
    fn get_frame(&mut self, out: &mut [u8]) -> Result<(), DecodeError>;

    /// Decoded frames currently queued for `get_frame`/`discard_frame`.
    fn decoded_frames_buffered(&self) -> usize;

    /// Drain residual frames out of the codec into the decoded queue.
    fn flush(&mut self) -> Result<(), DecodeError>;

    /// Barrier for adapters whose `get_frame` copies asynchronously.
    fn wait_until_frames_copied(&mut self) -> Result<(), DecodeError>;
}

/// Which adapter implementation to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    /// libavcodec on the CPU.
    Software,
    /// NVDEC through libavcodec's cuvid wrappers.
    Nvdec,
}

/// Build an adapter. `device` selects the GPU for [`DecoderKind::Nvdec`]
/// and is ignored by the software decoder.
pub fn new_decoder(
    kind: DecoderKind,
    device: u32,
    _num_devices: u32,
) -> Result<Box<dyn VideoDecoder>, DecodeError> {
    match kind {
        DecoderKind::Software => Ok(Box::new(software::SoftwareDecoder::new())),
        DecoderKind::Nvdec => Ok(Box::new(nvdec::NvdecDecoder::new(device))),
    }
}
