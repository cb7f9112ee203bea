//! MP4 to Annex-B bitstream conversion.
//!
//! MP4 stores each NAL unit with a length prefix and keeps the parameter
//! sets (SPS/PPS, plus VPS for HEVC) off to the side in the `avcC`/`hvcC`
//! configuration record. Decoders fed raw packets want Annex-B: start-code
//! framing with the parameter sets appearing in-band before each IDR. This
//! filter does that conversion, re-prepending the parameter sets before
//! every keyframe so each decode segment is self-contained.

use super::{DecodeError, VideoFormat};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

// hvcC NAL unit types whose arrays we carry over.
const HEVC_NAL_VPS: u8 = 32;
const HEVC_NAL_SPS: u8 = 33;
const HEVC_NAL_PPS: u8 = 34;

/// Converts length-prefixed samples to Annex-B.
///
/// Built from the stream's extradata at configure time; on a discontinuity
/// the adapter rebuilds it from its stored extradata copy.
pub struct Mp4ToAnnexB {
    /// Bytes in each NAL length prefix (1, 2, or 4).
    length_size: usize,
    /// Start-code framed parameter sets, prepended before keyframes.
    parameter_sets: Vec<u8>,
}

impl Mp4ToAnnexB {
    /// Parse an `avcC`/`hvcC` record. Empty extradata is accepted and
    /// yields a pass-through filter with 4-byte lengths, for streams that
    /// carry parameter sets in-band.
    pub fn new(format: VideoFormat, extradata: &[u8]) -> Result<Self, DecodeError> {
        if extradata.is_empty() {
            return Ok(Self {
                length_size: 4,
                parameter_sets: Vec::new(),
            });
        }
        match format {
            VideoFormat::H264 => Self::from_avcc(extradata),
            VideoFormat::Hevc => Self::from_hvcc(extradata),
        }
    }

    pub fn length_size(&self) -> usize {
        self.length_size
    }

    pub fn parameter_sets(&self) -> &[u8] {
        &self.parameter_sets
    }

    fn from_avcc(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 7 {
            return Err(DecodeError::InvalidExtradata(format!(
                "avcC record of {} bytes",
                data.len()
            )));
        }
        if data[0] != 1 {
            return Err(DecodeError::InvalidExtradata(format!(
                "avcC configurationVersion {}",
                data[0]
            )));
        }
        let length_size = (data[4] & 0x3) as usize + 1;
        let mut parameter_sets = Vec::new();
        let mut pos = 5usize;

        let sps_count = (read_u8(data, &mut pos)? & 0x1F) as usize;
        for _ in 0..sps_count {
            copy_nal(data, &mut pos, &mut parameter_sets)?;
        }
        let pps_count = read_u8(data, &mut pos)? as usize;
        for _ in 0..pps_count {
            copy_nal(data, &mut pos, &mut parameter_sets)?;
        }

        Ok(Self {
            length_size,
            parameter_sets,
        })
    }

    fn from_hvcc(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 23 {
            return Err(DecodeError::InvalidExtradata(format!(
                "hvcC record of {} bytes",
                data.len()
            )));
        }
        if data[0] != 1 {
            return Err(DecodeError::InvalidExtradata(format!(
                "hvcC configurationVersion {}",
                data[0]
            )));
        }
        let length_size = (data[21] & 0x3) as usize + 1;
        let mut parameter_sets = Vec::new();
        let mut pos = 22usize;

        let array_count = read_u8(data, &mut pos)? as usize;
        for _ in 0..array_count {
            let nal_type = read_u8(data, &mut pos)? & 0x3F;
            let nal_count = read_u16(data, &mut pos)? as usize;
            let wanted = matches!(nal_type, HEVC_NAL_VPS | HEVC_NAL_SPS | HEVC_NAL_PPS);
            for _ in 0..nal_count {
                if wanted {
                    copy_nal(data, &mut pos, &mut parameter_sets)?;
                } else {
                    let len = read_u16(data, &mut pos)? as usize;
                    skip(data, &mut pos, len)?;
                }
            }
        }

        Ok(Self {
            length_size,
            parameter_sets,
        })
    }

    /// Convert one sample. For keyframes the parameter sets are emitted
    /// first, so a decoder can start cold at any converted keyframe.
    pub fn convert(&self, sample: &[u8], keyframe: bool) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::with_capacity(
            sample.len()
                + if keyframe { self.parameter_sets.len() } else { 0 }
                + 16,
        );
        if keyframe {
            out.extend_from_slice(&self.parameter_sets);
        }
        let mut pos = 0usize;
        while pos < sample.len() {
            if pos + self.length_size > sample.len() {
                return Err(DecodeError::MalformedSample(format!(
                    "truncated NAL length prefix at byte {pos}"
                )));
            }
            let mut len = 0usize;
            for &b in &sample[pos..pos + self.length_size] {
                len = (len << 8) | b as usize;
            }
            pos += self.length_size;
            let nal = sample.get(pos..pos + len).ok_or_else(|| {
                DecodeError::MalformedSample(format!(
                    "NAL of {len} bytes at {pos} overruns {}-byte sample",
                    sample.len()
                ))
            })?;
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
            pos += len;
        }
        Ok(out)
    }
}

fn read_u8(data: &[u8], pos: &mut usize) -> Result<u8, DecodeError> {
    let b = *data
        .get(*pos)
        .ok_or_else(|| DecodeError::InvalidExtradata("record truncated".into()))?;
    *pos += 1;
    Ok(b)
}

fn read_u16(data: &[u8], pos: &mut usize) -> Result<u16, DecodeError> {
    let hi = read_u8(data, pos)?;
    let lo = read_u8(data, pos)?;
    Ok(u16::from_be_bytes([hi, lo]))
}

fn skip(data: &[u8], pos: &mut usize, count: usize) -> Result<(), DecodeError> {
    if *pos + count > data.len() {
        return Err(DecodeError::InvalidExtradata("record truncated".into()));
    }
    *pos += count;
    Ok(())
}

/// Copy one `u16`-length-prefixed NAL out of a configuration record,
/// start-code framed.
fn copy_nal(data: &[u8], pos: &mut usize, out: &mut Vec<u8>) -> Result<(), DecodeError> {
    let len = read_u16(data, pos)? as usize;
    let nal = data
        .get(*pos..*pos + len)
        .ok_or_else(|| DecodeError::InvalidExtradata("parameter set truncated".into()))?;
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(nal);
    *pos += len;
    Ok(())
}
