//! NVDEC decoder driven through libavcodec's cuvid wrappers.
//!
//! The GPU parser/decoder pair sits behind `h264_cuvid`/`hevc_cuvid`;
//! frames come back as NV12 and are converted to RGB24 on the way out. The
//! fixed output capacity of the hardware (32 decode surfaces) is mirrored by
//! a bounded ring: when it fills, frames stay queued inside the decoder
//! until the automaton drains some.

use std::collections::VecDeque;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as ScalerContext, Flags};
use ffmpeg_sys_next as ffi;
use tracing::debug;

use super::annexb::Mp4ToAnnexB;
use super::{DecodeError, FrameInfo, VideoDecoder, VideoFormat};

/// Hardware decode surfaces available to the output ring.
const MAX_OUTPUT_FRAMES: usize = 32;

/// NVDEC adapter. Construction is infallible; a machine without a
/// cuvid-capable libavcodec build fails at [`VideoDecoder::configure`].
pub struct NvdecDecoder {
    device: u32,
    info: Option<FrameInfo>,
    extradata: Vec<u8>,
    filter: Option<Mp4ToAnnexB>,
    decoder: Option<ffmpeg::decoder::Video>,
    scaler: Option<(Pixel, ScalerContext)>,
    ring: VecDeque<ffmpeg::frame::Video>,
    /// Monotone count of frames that have left the ring. Informational.
    last_displayed_frame: i64,
}

impl NvdecDecoder {
    pub fn new(device: u32) -> Self {
        Self {
            device,
            info: None,
            extradata: Vec::new(),
            filter: None,
            decoder: None,
            scaler: None,
            ring: VecDeque::with_capacity(MAX_OUTPUT_FRAMES),
            last_displayed_frame: -1,
        }
    }
}

/// How [`receive_frames`] treats the ring limit.
#[derive(PartialEq)]
enum Receive {
    /// Stop at `MAX_OUTPUT_FRAMES`; excess stays inside the codec.
    Bounded,
    /// Take everything; end-of-segment drains must not lose frames.
    Unbounded,
    /// Drop instead of queue; in-flight output is invalid.
    Discard,
}

fn receive_frames(
    decoder: &mut ffmpeg::decoder::Video,
    ring: &mut VecDeque<ffmpeg::frame::Video>,
    mode: Receive,
) -> Result<(), DecodeError> {
    loop {
        if mode == Receive::Bounded && ring.len() >= MAX_OUTPUT_FRAMES {
            return Ok(());
        }
        let mut frame = ffmpeg::frame::Video::empty();
        match decoder.receive_frame(&mut frame) {
            Ok(()) => {
                if mode != Receive::Discard {
                    ring.push_back(frame);
                }
            }
            Err(ffmpeg::Error::Other { errno: ffi::EAGAIN }) => return Ok(()),
            Err(ffmpeg::Error::Eof) => return Ok(()),
            Err(e) => return Err(DecodeError::ReceiveFrame(e.to_string())),
        }
    }
}

fn drain_codec(
    decoder: &mut ffmpeg::decoder::Video,
    ring: &mut VecDeque<ffmpeg::frame::Video>,
    mode: Receive,
) -> Result<(), DecodeError> {
    match decoder.send_eof() {
        Ok(()) | Err(ffmpeg::Error::Eof) => {}
        Err(e) => return Err(DecodeError::SendPacket(e.to_string())),
    }
    receive_frames(decoder, ring, mode)?;
    decoder.flush();
    Ok(())
}

impl VideoDecoder for NvdecDecoder {
    fn configure(&mut self, info: &FrameInfo, extradata: &[u8]) -> Result<(), DecodeError> {
        ffmpeg::init().map_err(|e| DecodeError::DecoderOpen(e.to_string()))?;

        self.ring.clear();
        self.scaler = None;
        self.last_displayed_frame = -1;

        let name = match info.format {
            VideoFormat::H264 => "h264_cuvid",
            VideoFormat::Hevc => "hevc_cuvid",
        };
        let codec = ffmpeg::decoder::find_by_name(name)
            .ok_or_else(|| DecodeError::DecoderNotFound(name.to_owned()))?;
        let context = ffmpeg::codec::Context::new_with_codec(codec);

        let mut options = ffmpeg::Dictionary::new();
        options.set("gpu", &self.device.to_string());
        options.set("surfaces", &MAX_OUTPUT_FRAMES.to_string());

        let decoder = context
            .decoder()
            .open_as_with(codec, options)
            .map_err(|e| DecodeError::DecoderOpen(format!("{name}: {e}")))?
            .video()
            .map_err(|e| DecodeError::DecoderOpen(e.to_string()))?;
        debug!(
            decoder = name,
            gpu = self.device,
            width = info.width,
            height = info.height,
            "configured nvdec decoder"
        );

        self.extradata = extradata.to_vec();
        self.filter = Some(Mp4ToAnnexB::new(info.format, extradata)?);
        self.decoder = Some(decoder);
        self.info = Some(*info);
        Ok(())
    }

    fn feed(
        &mut self,
        packet: &[u8],
        keyframe: bool,
        discontinuity: bool,
    ) -> Result<(), DecodeError> {
        let info = self.info.ok_or(DecodeError::NotConfigured)?;
        let decoder = self.decoder.as_mut().ok_or(DecodeError::NotConfigured)?;

        if discontinuity {
            self.ring.clear();
            drain_codec(decoder, &mut self.ring, Receive::Discard)?;
            self.last_displayed_frame = -1;
            self.filter = Some(Mp4ToAnnexB::new(info.format, &self.extradata)?);
            return Ok(());
        }

        if packet.is_empty() {
            drain_codec(decoder, &mut self.ring, Receive::Unbounded)?;
            debug!(
                displayed = self.last_displayed_frame,
                buffered = self.ring.len(),
                "drained nvdec at end of stream"
            );
            self.filter = Some(Mp4ToAnnexB::new(info.format, &self.extradata)?);
            return Ok(());
        }

        let filter = self.filter.as_ref().ok_or(DecodeError::NotConfigured)?;
        let annexb = filter.convert(packet, keyframe)?;
        let mut av_packet = ffmpeg::Packet::new(annexb.len());
        av_packet
            .data_mut()
            .ok_or_else(|| DecodeError::SendPacket("could not allocate packet".into()))?
            .copy_from_slice(&annexb);
        match decoder.send_packet(&av_packet) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno: ffi::EAGAIN }) => {
                // Decoder is backed up; make room and retry once.
                receive_frames(decoder, &mut self.ring, Receive::Bounded)?;
                if self.ring.len() >= MAX_OUTPUT_FRAMES {
                    return Err(DecodeError::OutputRingFull);
                }
                decoder
                    .send_packet(&av_packet)
                    .map_err(|e| DecodeError::SendPacket(e.to_string()))?;
            }
            Err(e) => return Err(DecodeError::SendPacket(e.to_string())),
        }
        receive_frames(decoder, &mut self.ring, Receive::Bounded)
    }

    fn discard_frame(&mut self) -> Result<(), DecodeError> {
        if self.ring.pop_front().is_some() {
            self.last_displayed_frame += 1;
        }
        Ok(())
    }

    fn get_frame(&mut self, out: &mut [u8]) -> Result<(), DecodeError> {
        let info = self.info.ok_or(DecodeError::NotConfigured)?;
        let frame = self.ring.pop_front().ok_or(DecodeError::NoFrameBuffered)?;
        self.last_displayed_frame += 1;

        let frame_size = info.frame_size();
        if out.len() < frame_size {
            return Err(DecodeError::BufferTooSmall {
                needed: frame_size,
                got: out.len(),
            });
        }

        // cuvid hands back NV12 in system memory; convert like any other
        // pixel format.
        let format = frame.format();
        if self.scaler.as_ref().map(|(f, _)| *f) != Some(format) {
            let scaler = ScalerContext::get(
                format,
                frame.width(),
                frame.height(),
                Pixel::RGB24,
                info.width,
                info.height,
                Flags::BILINEAR,
            )
            .map_err(|e| DecodeError::ScalerInit(e.to_string()))?;
            self.scaler = Some((format, scaler));
        }
        let (_, scaler) = self.scaler.as_mut().unwrap();

        let mut rgb = ffmpeg::frame::Video::empty();
        scaler
            .run(&frame, &mut rgb)
            .map_err(|e| DecodeError::Scale(e.to_string()))?;

        let width = info.width as usize;
        let height = info.height as usize;
        let stride = rgb.stride(0);
        let data = rgb.data(0);
        let row_bytes = width * 3;
        for row in 0..height {
            let src = &data[row * stride..row * stride + row_bytes];
            out[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(src);
        }
        Ok(())
    }

    fn decoded_frames_buffered(&self) -> usize {
        self.ring.len()
    }

    fn flush(&mut self) -> Result<(), DecodeError> {
        if let Some(decoder) = self.decoder.as_mut() {
            drain_codec(decoder, &mut self.ring, Receive::Unbounded)?;
        }
        Ok(())
    }

    fn wait_until_frames_copied(&mut self) -> Result<(), DecodeError> {
        // The RGB conversion in get_frame is synchronous by the time it
        // returns.
        Ok(())
    }
}
