//! Typed parsers for the ISO base-media boxes the index builder cares
//! about.
//!
//! Box payloads arrive as borrowed slices; headers are probed separately so
//! the builder can decide whether it has buffered enough of the file before
//! committing to a parse. Container boxes are walked with [`children`],
//! which yields each child's header, payload, and absolute file offset.

use super::bits::BitReader;
use super::IndexError;

/// Four-character box/brand/codec code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const FTYP: FourCc = FourCc(*b"ftyp");
    pub const MOOV: FourCc = FourCc(*b"moov");
    pub const MOOF: FourCc = FourCc(*b"moof");
    pub const TRAK: FourCc = FourCc(*b"trak");
    pub const MDIA: FourCc = FourCc(*b"mdia");
    pub const MDHD: FourCc = FourCc(*b"mdhd");
    pub const HDLR: FourCc = FourCc(*b"hdlr");
    pub const MINF: FourCc = FourCc(*b"minf");
    pub const STBL: FourCc = FourCc(*b"stbl");
    pub const STSZ: FourCc = FourCc(*b"stsz");
    pub const STZ2: FourCc = FourCc(*b"stz2");
    pub const STSC: FourCc = FourCc(*b"stsc");
    pub const STCO: FourCc = FourCc(*b"stco");
    pub const CO64: FourCc = FourCc(*b"co64");
    pub const STSS: FourCc = FourCc(*b"stss");
    pub const STSD: FourCc = FourCc(*b"stsd");
    pub const MVEX: FourCc = FourCc(*b"mvex");
    pub const TREX: FourCc = FourCc(*b"trex");
    pub const LEVA: FourCc = FourCc(*b"leva");
    pub const TRAF: FourCc = FourCc(*b"traf");
    pub const TFHD: FourCc = FourCc(*b"tfhd");
    pub const TRUN: FourCc = FourCc(*b"trun");
    pub const UUID: FourCc = FourCc(*b"uuid");
    pub const AVCC: FourCc = FourCc(*b"avcC");
    pub const HVCC: FourCc = FourCc(*b"hvcC");
    pub const VIDE: FourCc = FourCc(*b"vide");

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// Header of a box: total size (including the header itself) and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: FourCc,
    pub size: u64,
    pub header_len: u64,
}

/// Read a box header from the front of `data` without consuming payload
/// bytes. Handles 64-bit `largesize` and the 16-byte `uuid` extension.
pub fn probe_box(data: &[u8]) -> Result<BoxHeader, IndexError> {
    let mut r = BitReader::new(data);
    let mut size = u64::from(r.read_u32()?);
    let box_type = FourCc(r.read_exact(4)?.try_into().unwrap());
    let mut header_len = 8u64;
    if size == 1 {
        size = r.read_u64()?;
        header_len += 8;
    }
    if box_type == FourCc::UUID {
        r.skip_bytes(16)?;
        header_len += 16;
    }
    if size != 0 && size < header_len {
        return Err(IndexError::Malformed(format!(
            "box '{box_type}' declares size {size} smaller than its header"
        )));
    }
    Ok(BoxHeader {
        box_type,
        size,
        header_len,
    })
}

/// A child box inside a parent payload.
pub struct RawBox<'a> {
    pub header: BoxHeader,
    pub payload: &'a [u8],
    /// Absolute file offset of the box start (header included).
    pub offset: u64,
}

/// Iterator over the child boxes of a container payload. `base` is the
/// absolute file offset of `data[0]`.
pub struct BoxChildren<'a> {
    data: &'a [u8],
    pos: usize,
    base: u64,
}

pub fn children(data: &[u8], base: u64) -> BoxChildren<'_> {
    BoxChildren { data, pos: 0, base }
}

impl<'a> Iterator for BoxChildren<'a> {
    type Item = Result<RawBox<'a>, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let header = match probe_box(rest) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };
        if header.size == 0 || header.size > rest.len() as u64 {
            return Some(Err(IndexError::Malformed(format!(
                "box '{}' overruns its container",
                header.box_type
            ))));
        }
        let payload = &rest[header.header_len as usize..header.size as usize];
        let offset = self.base + self.pos as u64;
        self.pos += header.size as usize;
        Some(Ok(RawBox {
            header,
            payload,
            offset,
        }))
    }
}

/// Find the first child of the given type, or `None`.
pub fn find_child<'a>(
    data: &'a [u8],
    base: u64,
    box_type: FourCc,
) -> Result<Option<RawBox<'a>>, IndexError> {
    for child in children(data, base) {
        let child = child?;
        if child.header.box_type == box_type {
            return Ok(Some(child));
        }
    }
    Ok(None)
}

/// Version and flags of a full box, with a reader positioned after them.
fn full_box(payload: &[u8]) -> Result<(u8, u32, BitReader<'_>), IndexError> {
    let mut r = BitReader::new(payload);
    let version = r.read_u8()?;
    let flags = r.read_u24()?;
    Ok((version, flags, r))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTypeBox {
    pub major_brand: FourCc,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCc>,
}

pub fn parse_ftyp(payload: &[u8]) -> Result<FileTypeBox, IndexError> {
    let mut r = BitReader::new(payload);
    let major_brand = FourCc(r.read_exact(4)?.try_into().unwrap());
    let minor_version = r.read_u32()?;
    let mut compatible_brands = Vec::new();
    while r.remaining_bytes() >= 4 {
        compatible_brands.push(FourCc(r.read_exact(4)?.try_into().unwrap()));
    }
    Ok(FileTypeBox {
        major_brand,
        minor_version,
        compatible_brands,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaHeaderBox {
    pub timescale: u32,
    pub duration: u64,
}

pub fn parse_mdhd(payload: &[u8]) -> Result<MediaHeaderBox, IndexError> {
    let (version, _flags, mut r) = full_box(payload)?;
    match version {
        0 => {
            r.skip_bytes(8)?; // creation_time, modification_time
            let timescale = r.read_u32()?;
            let duration = u64::from(r.read_u32()?);
            Ok(MediaHeaderBox {
                timescale,
                duration,
            })
        }
        1 => {
            r.skip_bytes(16)?;
            let timescale = r.read_u32()?;
            let duration = r.read_u64()?;
            Ok(MediaHeaderBox {
                timescale,
                duration,
            })
        }
        v => Err(IndexError::Malformed(format!("mdhd version {v}"))),
    }
}

/// Handler type from an `hdlr` box (`vide` marks the video track).
pub fn parse_hdlr(payload: &[u8]) -> Result<FourCc, IndexError> {
    let (_version, _flags, mut r) = full_box(payload)?;
    r.skip_bytes(4)?; // pre_defined
    Ok(FourCc(r.read_exact(4)?.try_into().unwrap()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSizeBox {
    /// Constant size for all samples, or 0 when `entry_sizes` is used.
    pub sample_size: u32,
    pub sample_count: u32,
    pub entry_sizes: Vec<u32>,
}

impl SampleSizeBox {
    pub fn size_of(&self, sample: usize) -> u64 {
        if self.sample_size != 0 {
            u64::from(self.sample_size)
        } else {
            u64::from(self.entry_sizes[sample])
        }
    }
}

pub fn parse_stsz(payload: &[u8]) -> Result<SampleSizeBox, IndexError> {
    let (_version, _flags, mut r) = full_box(payload)?;
    let sample_size = r.read_u32()?;
    let sample_count = r.read_u32()?;
    let mut entry_sizes = Vec::new();
    if sample_size == 0 {
        entry_sizes.reserve(sample_count as usize);
        for _ in 0..sample_count {
            entry_sizes.push(r.read_u32()?);
        }
    }
    Ok(SampleSizeBox {
        sample_size,
        sample_count,
        entry_sizes,
    })
}

/// Compact sample size box: sizes in 4, 8, or 16-bit fields.
pub fn parse_stz2(payload: &[u8]) -> Result<SampleSizeBox, IndexError> {
    let (_version, _flags, mut r) = full_box(payload)?;
    r.skip_bytes(3)?; // reserved
    let field_size = u32::from(r.read_u8()?);
    if !matches!(field_size, 4 | 8 | 16) {
        return Err(IndexError::Malformed(format!(
            "stz2 field size {field_size}"
        )));
    }
    let sample_count = r.read_u32()?;
    let mut entry_sizes = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        entry_sizes.push(r.read_bits(field_size)? as u32);
    }
    Ok(SampleSizeBox {
        sample_size: 0,
        sample_count,
        entry_sizes,
    })
}

/// Expand an `stsc` box into a per-sample chunk assignment (1-based chunk
/// numbers). The final run repeats until `sample_count` samples are
/// assigned.
pub fn parse_stsc(payload: &[u8], sample_count: u64) -> Result<Vec<u64>, IndexError> {
    let (_version, _flags, mut r) = full_box(payload)?;
    let entry_count = r.read_u32()?;
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let first_chunk = r.read_u32()?;
        let samples_per_chunk = r.read_u32()?;
        let _sample_description_index = r.read_u32()?;
        entries.push((u64::from(first_chunk), u64::from(samples_per_chunk)));
    }

    let mut assignment = Vec::with_capacity(sample_count as usize);
    if sample_count == 0 {
        return Ok(assignment);
    }
    if entries.is_empty() {
        return Err(IndexError::Malformed("stsc has no entries".into()));
    }

    for (i, &(first_chunk, samples_per_chunk)) in entries.iter().enumerate() {
        let next_first = entries.get(i + 1).map(|e| e.0);
        let mut chunk = first_chunk;
        loop {
            if next_first == Some(chunk) {
                break;
            }
            if samples_per_chunk == 0 {
                return Err(IndexError::Malformed("stsc run with zero samples".into()));
            }
            for _ in 0..samples_per_chunk {
                assignment.push(chunk);
                if assignment.len() as u64 == sample_count {
                    return Ok(assignment);
                }
            }
            chunk += 1;
        }
    }
    Err(IndexError::Malformed(format!(
        "stsc covers {} of {} samples",
        assignment.len(),
        sample_count
    )))
}

pub fn parse_stco(payload: &[u8]) -> Result<Vec<u64>, IndexError> {
    let (_version, _flags, mut r) = full_box(payload)?;
    let entry_count = r.read_u32()?;
    let mut offsets = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        offsets.push(u64::from(r.read_u32()?));
    }
    Ok(offsets)
}

pub fn parse_co64(payload: &[u8]) -> Result<Vec<u64>, IndexError> {
    let (_version, _flags, mut r) = full_box(payload)?;
    let entry_count = r.read_u32()?;
    let mut offsets = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        offsets.push(r.read_u64()?);
    }
    Ok(offsets)
}

/// Sync sample numbers, 1-based as stored.
pub fn parse_stss(payload: &[u8]) -> Result<Vec<u64>, IndexError> {
    let (_version, _flags, mut r) = full_box(payload)?;
    let entry_count = r.read_u32()?;
    let mut samples = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        samples.push(u64::from(r.read_u32()?));
    }
    Ok(samples)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualSampleEntry {
    pub format: FourCc,
    pub width: u16,
    pub height: u16,
    /// Payload of the inner `avcC`/`hvcC` box.
    pub extradata: Vec<u8>,
}

const VISUAL_ENTRY_FIXED_LEN: usize = 78;

fn codec_tag_supported(tag: FourCc) -> bool {
    matches!(&tag.0, b"avc1" | b"avc3" | b"hev1" | b"hvc1" | b"hevc")
}

/// Parse the first visual sample entry out of an `stsd` box.
pub fn parse_stsd(payload: &[u8]) -> Result<VisualSampleEntry, IndexError> {
    let (_version, _flags, mut r) = full_box(payload)?;
    let entry_count = r.read_u32()?;
    if entry_count == 0 {
        return Err(IndexError::Malformed("stsd has no entries".into()));
    }
    let entries = &payload[r.byte_pos()..];
    for entry in children(entries, 0) {
        let entry = entry?;
        if !codec_tag_supported(entry.header.box_type) {
            return Err(IndexError::UnsupportedCodecTag(
                entry.header.box_type.to_string(),
            ));
        }
        let mut er = BitReader::new(entry.payload);
        er.skip_bytes(6)?; // reserved
        er.skip_bytes(2)?; // data_reference_index
        er.skip_bytes(16)?; // pre_defined + reserved
        let width = er.read_u16()?;
        let height = er.read_u16()?;
        er.skip_bytes(4 + 4 + 4)?; // resolutions, reserved
        er.skip_bytes(2)?; // frame_count
        er.skip_bytes(32)?; // compressorname
        er.skip_bytes(2 + 2)?; // depth, pre_defined
        debug_assert_eq!(er.byte_pos(), VISUAL_ENTRY_FIXED_LEN);

        let config = &entry.payload[VISUAL_ENTRY_FIXED_LEN..];
        let mut extradata = Vec::new();
        for child in children(config, 0) {
            let child = child?;
            if child.header.box_type == FourCc::AVCC || child.header.box_type == FourCc::HVCC {
                extradata = child.payload.to_vec();
                break;
            }
        }
        return Ok(VisualSampleEntry {
            format: entry.header.box_type,
            width,
            height,
            extradata,
        });
    }
    Err(IndexError::Malformed("stsd entries truncated".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackExtendsBox {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

pub fn parse_trex(payload: &[u8]) -> Result<TrackExtendsBox, IndexError> {
    let (_version, _flags, mut r) = full_box(payload)?;
    Ok(TrackExtendsBox {
        track_id: r.read_u32()?,
        default_sample_description_index: r.read_u32()?,
        default_sample_duration: r.read_u32()?,
        default_sample_size: r.read_u32()?,
        default_sample_flags: r.read_u32()?,
    })
}

/// How a track fragment anchors its sample data in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseOffset {
    /// `base_data_offset` was present in the `tfhd`.
    Provided(u64),
    /// `default-base-is-moof` flag: offsets relative to the enclosing
    /// `moof` start.
    Moof,
    /// Neither flag: first `traf` starts at the `moof`, later ones continue
    /// from the previous `traf`'s last byte.
    Relative,
}

const TFHD_BASE_DATA_OFFSET: u32 = 0x1;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x2;
const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x8;
const TFHD_DEFAULT_SAMPLE_SIZE: u32 = 0x10;
const TFHD_DEFAULT_SAMPLE_FLAGS: u32 = 0x20;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x0002_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackFragmentHeaderBox {
    pub track_id: u32,
    pub base_offset: BaseOffset,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
}

pub fn parse_tfhd(payload: &[u8]) -> Result<TrackFragmentHeaderBox, IndexError> {
    let (_version, flags, mut r) = full_box(payload)?;
    let track_id = r.read_u32()?;
    let base_data_offset = if flags & TFHD_BASE_DATA_OFFSET != 0 {
        Some(r.read_u64()?)
    } else {
        None
    };
    let sample_description_index = if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        Some(r.read_u32()?)
    } else {
        None
    };
    let default_sample_duration = if flags & TFHD_DEFAULT_SAMPLE_DURATION != 0 {
        Some(r.read_u32()?)
    } else {
        None
    };
    let default_sample_size = if flags & TFHD_DEFAULT_SAMPLE_SIZE != 0 {
        Some(r.read_u32()?)
    } else {
        None
    };
    let default_sample_flags = if flags & TFHD_DEFAULT_SAMPLE_FLAGS != 0 {
        Some(r.read_u32()?)
    } else {
        None
    };

    let base_offset = match base_data_offset {
        Some(offset) => BaseOffset::Provided(offset),
        None if flags & TFHD_DEFAULT_BASE_IS_MOOF != 0 => BaseOffset::Moof,
        None => BaseOffset::Relative,
    };

    Ok(TrackFragmentHeaderBox {
        track_id,
        base_offset,
        sample_description_index,
        default_sample_duration,
        default_sample_size,
        default_sample_flags,
    })
}

const TRUN_DATA_OFFSET: u32 = 0x1;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x4;
const TRUN_SAMPLE_DURATION: u32 = 0x100;
const TRUN_SAMPLE_SIZE: u32 = 0x200;
const TRUN_SAMPLE_FLAGS: u32 = 0x400;
const TRUN_SAMPLE_COMPOSITION_OFFSET: u32 = 0x800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub composition_offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRunBox {
    /// Offset of the run's data relative to the fragment base.
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub samples: Vec<TrunSample>,
}

pub fn parse_trun(payload: &[u8]) -> Result<TrackRunBox, IndexError> {
    let (version, flags, mut r) = full_box(payload)?;
    let sample_count = r.read_u32()?;
    let data_offset = if flags & TRUN_DATA_OFFSET != 0 {
        Some(r.read_i32()?)
    } else {
        None
    };
    let first_sample_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        Some(r.read_u32()?)
    } else {
        None
    };
    let mut samples = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        let mut sample = TrunSample::default();
        if flags & TRUN_SAMPLE_DURATION != 0 {
            sample.duration = Some(r.read_u32()?);
        }
        if flags & TRUN_SAMPLE_SIZE != 0 {
            sample.size = Some(r.read_u32()?);
        }
        if flags & TRUN_SAMPLE_FLAGS != 0 {
            sample.flags = Some(r.read_u32()?);
        }
        if flags & TRUN_SAMPLE_COMPOSITION_OFFSET != 0 {
            sample.composition_offset = Some(if version == 0 {
                i64::from(r.read_u32()?)
            } else {
                i64::from(r.read_i32()?)
            });
        }
        samples.push(sample);
    }
    Ok(TrackRunBox {
        data_offset,
        first_sample_flags,
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        out
    }

    fn full_boxed(box_type: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(4 + body.len());
        payload.push(version);
        payload.extend_from_slice(&flags.to_be_bytes()[1..]);
        payload.extend_from_slice(body);
        boxed(box_type, &payload)
    }

    #[test]
    fn test_probe_box_plain() {
        let b = boxed(b"ftyp", &[0u8; 8]);
        let header = probe_box(&b).unwrap();
        assert_eq!(header.box_type, FourCc::FTYP);
        assert_eq!(header.size, 16);
        assert_eq!(header.header_len, 8);
    }

    #[test]
    fn test_probe_box_largesize() {
        let mut b = Vec::new();
        b.extend_from_slice(&1u32.to_be_bytes());
        b.extend_from_slice(b"mdat");
        b.extend_from_slice(&24u64.to_be_bytes());
        b.extend_from_slice(&[0u8; 8]);
        let header = probe_box(&b).unwrap();
        assert_eq!(header.size, 24);
        assert_eq!(header.header_len, 16);
    }

    #[test]
    fn test_probe_box_undersized() {
        let mut b = boxed(b"free", &[]);
        b[3] = 4; // size 4 < header
        assert!(probe_box(&b).is_err());
    }

    #[test]
    fn test_children_iteration() {
        let mut data = boxed(b"mdhd", &[1, 2, 3]);
        data.extend_from_slice(&boxed(b"hdlr", &[4, 5]));
        let kinds: Vec<_> = children(&data, 100)
            .map(|c| c.unwrap())
            .map(|c| (c.header.box_type, c.offset, c.payload.len()))
            .collect();
        assert_eq!(
            kinds,
            vec![(FourCc::MDHD, 100, 3), (FourCc::HDLR, 111, 2)]
        );
    }

    #[test]
    fn test_children_overrun() {
        let mut data = boxed(b"mdhd", &[1, 2, 3]);
        data.truncate(data.len() - 1);
        assert!(children(&data, 0).next().unwrap().is_err());
    }

    #[test]
    fn test_parse_ftyp() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"mp42");
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(b"mp42isom");
        let ftyp = parse_ftyp(&payload).unwrap();
        assert_eq!(ftyp.major_brand, FourCc(*b"mp42"));
        assert_eq!(
            ftyp.compatible_brands,
            vec![FourCc(*b"mp42"), FourCc(*b"isom")]
        );
    }

    #[test]
    fn test_parse_mdhd_versions() {
        let mut v0 = vec![0u8; 8];
        v0.extend_from_slice(&90000u32.to_be_bytes());
        v0.extend_from_slice(&450000u32.to_be_bytes());
        v0.extend_from_slice(&[0, 0, 0, 0]); // language, pre_defined
        let full = full_boxed(b"mdhd", 0, 0, &v0);
        let parsed = parse_mdhd(&full[8..]).unwrap();
        assert_eq!(parsed.timescale, 90000);
        assert_eq!(parsed.duration, 450000);

        let mut v1 = vec![0u8; 16];
        v1.extend_from_slice(&600u32.to_be_bytes());
        v1.extend_from_slice(&36000u64.to_be_bytes());
        let full = full_boxed(b"mdhd", 1, 0, &v1);
        let parsed = parse_mdhd(&full[8..]).unwrap();
        assert_eq!(parsed.timescale, 600);
        assert_eq!(parsed.duration, 36000);
    }

    #[test]
    fn test_parse_stsz_constant_and_table() {
        let mut body = Vec::new();
        body.extend_from_slice(&100u32.to_be_bytes());
        body.extend_from_slice(&7u32.to_be_bytes());
        let b = full_boxed(b"stsz", 0, 0, &body);
        let stsz = parse_stsz(&b[8..]).unwrap();
        assert_eq!(stsz.sample_count, 7);
        assert_eq!(stsz.size_of(3), 100);

        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&3u32.to_be_bytes());
        for size in [10u32, 20, 30] {
            body.extend_from_slice(&size.to_be_bytes());
        }
        let b = full_boxed(b"stsz", 0, 0, &body);
        let stsz = parse_stsz(&b[8..]).unwrap();
        assert_eq!(stsz.entry_sizes, vec![10, 20, 30]);
        assert_eq!(stsz.size_of(1), 20);
    }

    #[test]
    fn test_parse_stz2_nibble_sizes() {
        // Three 4-bit sizes (5, 9, 12) plus the odd-count pad nibble.
        let mut body = vec![0, 0, 0, 4];
        body.extend_from_slice(&3u32.to_be_bytes());
        body.push(0x59);
        body.push(0xC0);
        let b = full_boxed(b"stz2", 0, 0, &body);
        let stz2 = parse_stz2(&b[8..]).unwrap();
        assert_eq!(stz2.entry_sizes, vec![5, 9, 12]);
    }

    #[test]
    fn test_parse_stsc_expansion() {
        // Chunks 1-2 hold 2 samples each, chunks 3+ hold 3.
        let mut body = Vec::new();
        body.extend_from_slice(&2u32.to_be_bytes());
        for (first, per, sdi) in [(1u32, 2u32, 1u32), (3, 3, 1)] {
            body.extend_from_slice(&first.to_be_bytes());
            body.extend_from_slice(&per.to_be_bytes());
            body.extend_from_slice(&sdi.to_be_bytes());
        }
        let b = full_boxed(b"stsc", 0, 0, &body);
        let assignment = parse_stsc(&b[8..], 10).unwrap();
        assert_eq!(assignment, vec![1, 1, 2, 2, 3, 3, 3, 4, 4, 4]);
    }

    #[test]
    fn test_parse_stsc_last_run_repeats() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        let b = full_boxed(b"stsc", 0, 0, &body);
        let assignment = parse_stsc(&b[8..], 5).unwrap();
        assert_eq!(assignment, vec![1, 1, 2, 2, 3]);
    }

    #[test]
    fn test_parse_chunk_offsets() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(&64u32.to_be_bytes());
        body.extend_from_slice(&4096u32.to_be_bytes());
        let b = full_boxed(b"stco", 0, 0, &body);
        assert_eq!(parse_stco(&b[8..]).unwrap(), vec![64, 4096]);

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&0x1_0000_0000u64.to_be_bytes());
        let b = full_boxed(b"co64", 0, 0, &body);
        assert_eq!(parse_co64(&b[8..]).unwrap(), vec![0x1_0000_0000]);
    }

    #[test]
    fn test_parse_stss() {
        let mut body = Vec::new();
        body.extend_from_slice(&3u32.to_be_bytes());
        for n in [1u32, 31, 61] {
            body.extend_from_slice(&n.to_be_bytes());
        }
        let b = full_boxed(b"stss", 0, 0, &body);
        assert_eq!(parse_stss(&b[8..]).unwrap(), vec![1, 31, 61]);
    }

    fn visual_entry(format: &[u8; 4], width: u16, height: u16, config: &[u8]) -> Vec<u8> {
        let mut entry = Vec::new();
        entry.extend_from_slice(&[0u8; 6]);
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0u8; 16]);
        entry.extend_from_slice(&width.to_be_bytes());
        entry.extend_from_slice(&height.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&0u32.to_be_bytes());
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0u8; 32]);
        entry.extend_from_slice(&0x0018u16.to_be_bytes());
        entry.extend_from_slice(&(-1i16).to_be_bytes());
        entry.extend_from_slice(config);
        boxed(format, &entry)
    }

    #[test]
    fn test_parse_stsd_avc1() {
        let avcc = boxed(b"avcC", &[1, 0x64, 0, 0x1F, 0xFF]);
        let entry = visual_entry(b"avc1", 1920, 1080, &avcc);
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&entry);
        let b = full_boxed(b"stsd", 0, 0, &body);
        let vse = parse_stsd(&b[8..]).unwrap();
        assert_eq!(vse.format, FourCc(*b"avc1"));
        assert_eq!(vse.width, 1920);
        assert_eq!(vse.height, 1080);
        assert_eq!(vse.extradata, vec![1, 0x64, 0, 0x1F, 0xFF]);
    }

    #[test]
    fn test_parse_stsd_rejects_unknown_tag() {
        let entry = visual_entry(b"vp09", 640, 480, &[]);
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&entry);
        let b = full_boxed(b"stsd", 0, 0, &body);
        assert!(matches!(
            parse_stsd(&b[8..]),
            Err(IndexError::UnsupportedCodecTag(_))
        ));
    }

    #[test]
    fn test_parse_trex() {
        let mut body = Vec::new();
        for v in [1u32, 1, 512, 4000, 0x0001_0000] {
            body.extend_from_slice(&v.to_be_bytes());
        }
        let b = full_boxed(b"trex", 0, 0, &body);
        let trex = parse_trex(&b[8..]).unwrap();
        assert_eq!(trex.track_id, 1);
        assert_eq!(trex.default_sample_size, 4000);
        assert_eq!(trex.default_sample_flags, 0x0001_0000);
    }

    #[test]
    fn test_parse_tfhd_base_offset_kinds() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&9000u64.to_be_bytes());
        let b = full_boxed(b"tfhd", 0, 0x1, &body);
        let tfhd = parse_tfhd(&b[8..]).unwrap();
        assert_eq!(tfhd.base_offset, BaseOffset::Provided(9000));

        let body = 1u32.to_be_bytes();
        let b = full_boxed(b"tfhd", 0, 0x0002_0000, &body);
        assert_eq!(parse_tfhd(&b[8..]).unwrap().base_offset, BaseOffset::Moof);

        let b = full_boxed(b"tfhd", 0, 0, &body);
        assert_eq!(
            parse_tfhd(&b[8..]).unwrap().base_offset,
            BaseOffset::Relative
        );
    }

    #[test]
    fn test_parse_tfhd_defaults() {
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(&1400u32.to_be_bytes()); // default_sample_size
        body.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // default_sample_flags
        let b = full_boxed(b"tfhd", 0, 0x10 | 0x20, &body);
        let tfhd = parse_tfhd(&b[8..]).unwrap();
        assert_eq!(tfhd.track_id, 7);
        assert_eq!(tfhd.default_sample_size, Some(1400));
        assert_eq!(tfhd.default_sample_flags, Some(0x0001_0000));
        assert_eq!(tfhd.default_sample_duration, None);
    }

    #[test]
    fn test_parse_trun_per_sample_fields() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(&16i32.to_be_bytes()); // data_offset
        body.extend_from_slice(&100u32.to_be_bytes()); // sample 0 size
        body.extend_from_slice(&0u32.to_be_bytes()); // sample 0 flags
        body.extend_from_slice(&200u32.to_be_bytes()); // sample 1 size
        body.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // sample 1 flags
        let b = full_boxed(b"trun", 0, 0x1 | 0x200 | 0x400, &body);
        let trun = parse_trun(&b[8..]).unwrap();
        assert_eq!(trun.data_offset, Some(16));
        assert_eq!(trun.samples.len(), 2);
        assert_eq!(trun.samples[0].size, Some(100));
        assert_eq!(trun.samples[0].flags, Some(0));
        assert_eq!(trun.samples[1].flags, Some(0x0001_0000));
    }

    #[test]
    fn test_parse_trun_first_sample_flags_only() {
        let mut body = Vec::new();
        body.extend_from_slice(&3u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // first_sample_flags
        let b = full_boxed(b"trun", 0, 0x4, &body);
        let trun = parse_trun(&b[8..]).unwrap();
        assert_eq!(trun.first_sample_flags, Some(0));
        assert_eq!(trun.data_offset, None);
        assert!(trun.samples.iter().all(|s| s.size.is_none()));
    }
}
