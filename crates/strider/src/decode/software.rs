//! Software decoder: libavcodec H.264/HEVC with RGB24 output.

use std::collections::VecDeque;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as ScalerContext, Flags};
use ffmpeg_sys_next as ffi;
use tracing::debug;

use super::annexb::Mp4ToAnnexB;
use super::{DecodeError, FrameInfo, VideoDecoder, VideoFormat};

/// CPU decoder. Samples are converted to Annex-B (with parameter sets
/// inlined before keyframes) and pushed through a frame-threaded codec
/// context; decoded frames queue up until the automaton pops or discards
/// them.
pub struct SoftwareDecoder {
    thread_count: usize,
    info: Option<FrameInfo>,
    extradata: Vec<u8>,
    filter: Option<Mp4ToAnnexB>,
    decoder: Option<ffmpeg::decoder::Video>,
    /// Cached RGB24 scaler, rebuilt when the codec's pixel format changes.
    scaler: Option<(Pixel, ScalerContext)>,
    queue: VecDeque<ffmpeg::frame::Video>,
}

impl SoftwareDecoder {
    pub fn new() -> Self {
        Self {
            thread_count: num_cpus::get().min(16),
            info: None,
            extradata: Vec::new(),
            filter: None,
            decoder: None,
            scaler: None,
            queue: VecDeque::new(),
        }
    }
}

impl Default for SoftwareDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull every frame currently available out of the codec. Frames go into
/// `queue` unless `discard` is set (flush path), in which case they are
/// dropped on the floor.
fn receive_frames(
    decoder: &mut ffmpeg::decoder::Video,
    queue: &mut VecDeque<ffmpeg::frame::Video>,
    discard: bool,
) -> Result<(), DecodeError> {
    loop {
        let mut frame = ffmpeg::frame::Video::empty();
        match decoder.receive_frame(&mut frame) {
            Ok(()) => {
                if !discard {
                    queue.push_back(frame);
                }
            }
            Err(ffmpeg::Error::Other { errno: ffi::EAGAIN }) => return Ok(()),
            Err(ffmpeg::Error::Eof) => return Ok(()),
            Err(e) => return Err(DecodeError::ReceiveFrame(e.to_string())),
        }
    }
}

/// Signal end of stream and collect the codec's delayed frames, then reset
/// it so the next segment can start fresh.
fn drain_codec(
    decoder: &mut ffmpeg::decoder::Video,
    queue: &mut VecDeque<ffmpeg::frame::Video>,
    discard: bool,
) -> Result<(), DecodeError> {
    match decoder.send_eof() {
        Ok(()) | Err(ffmpeg::Error::Eof) => {}
        Err(e) => return Err(DecodeError::SendPacket(e.to_string())),
    }
    receive_frames(decoder, queue, discard)?;
    decoder.flush();
    Ok(())
}

impl VideoDecoder for SoftwareDecoder {
    fn configure(&mut self, info: &FrameInfo, extradata: &[u8]) -> Result<(), DecodeError> {
        ffmpeg::init().map_err(|e| DecodeError::DecoderOpen(e.to_string()))?;

        self.queue.clear();
        self.scaler = None;

        let codec_id = match info.format {
            VideoFormat::H264 => ffmpeg::codec::Id::H264,
            VideoFormat::Hevc => ffmpeg::codec::Id::HEVC,
        };
        let codec = ffmpeg::decoder::find(codec_id)
            .ok_or_else(|| DecodeError::DecoderNotFound(info.format.to_string()))?;
        let mut context = ffmpeg::codec::Context::new_with_codec(codec);
        context.set_threading(ffmpeg::codec::threading::Config::count(self.thread_count));

        let decoder = context
            .decoder()
            .video()
            .map_err(|e| DecodeError::DecoderOpen(e.to_string()))?;
        debug!(
            format = %info.format,
            width = info.width,
            height = info.height,
            threads = self.thread_count,
            "configured software decoder"
        );

        // The filter owns its own copy of the extradata; it is rebuilt from
        // this stored copy on every discontinuity.
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
            // Unrelated data follows: drop everything buffered, reset the
            // codec, and rebuild the filter so the next keyframe carries
            // parameter sets again.
            self.queue.clear();
            drain_codec(decoder, &mut self.queue, true)?;
            self.filter = Some(Mp4ToAnnexB::new(info.format, &self.extradata)?);
            return Ok(());
        }

        if packet.is_empty() {
            // End of segment: surface the codec's delayed frames, then
            // reset for the next segment.
            drain_codec(decoder, &mut self.queue, false)?;
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
        decoder
            .send_packet(&av_packet)
            .map_err(|e| DecodeError::SendPacket(e.to_string()))?;
        receive_frames(decoder, &mut self.queue, false)
    }

    fn discard_frame(&mut self) -> Result<(), DecodeError> {
        self.queue.pop_front();
        Ok(())
    }

    fn get_frame(&mut self, out: &mut [u8]) -> Result<(), DecodeError> {
        let info = self.info.ok_or(DecodeError::NotConfigured)?;
        let frame = self.queue.pop_front().ok_or(DecodeError::NoFrameBuffered)?;

        let frame_size = info.frame_size();
        if out.len() < frame_size {
            return Err(DecodeError::BufferTooSmall {
                needed: frame_size,
                got: out.len(),
            });
        }

        // The codec's pixel format is only known once frames come out, so
        // the scaler is built lazily and cached per format. Source
        // dimensions come from the frame itself (codecs may round up to
        // macroblock sizes), destination from the configured stream.
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

        // Tightly pack the possibly-padded scaler output.
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
        self.queue.len()
    }

    fn flush(&mut self) -> Result<(), DecodeError> {
        if let Some(decoder) = self.decoder.as_mut() {
            drain_codec(decoder, &mut self.queue, false)?;
        }
        Ok(())
    }

    fn wait_until_frames_copied(&mut self) -> Result<(), DecodeError> {
        // get_frame copies synchronously.
        Ok(())
    }
}
