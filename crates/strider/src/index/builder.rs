//! Resumable, bounded-memory MP4 index builder.
//!
//! The builder never sees the whole file. The caller reads whatever window
//! the builder asks for and hands it back through [`Mp4IndexBuilder::feed`];
//! the builder either parses what it has or answers with the next window it
//! needs. Boxes it does not care about are skipped by jumping the requested
//! offset past them, so an `mdat` of any size costs one request.

use tracing::debug;

use super::boxes::{self, BaseOffset, FourCc, TrackExtendsBox};
use super::{IndexError, VideoIndex};

/// Small read used while scanning for the next interesting box.
const READ_AHEAD: u64 = 1024;

/// What the builder wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRequest {
    /// True once parsing has finished (successfully or not); `next_offset`
    /// and `next_size` are meaningless then.
    pub done: bool,
    /// Absolute file offset the next `feed` buffer must start at.
    pub next_offset: u64,
    /// Number of bytes the next `feed` buffer must contain.
    pub next_size: u64,
}

impl FeedRequest {
    fn done() -> Self {
        FeedRequest {
            done: true,
            next_offset: 0,
            next_size: 0,
        }
    }
}

/// Streaming parser that turns an MP4 file into a [`VideoIndex`].
///
/// Recognizes classic files (sample table inside `moov`) and fragmented
/// files (`moov/mvex` plus any number of `moof`s). Everything else is
/// skipped. Errors are terminal: the builder reports `done`, `is_error()`
/// turns true, and [`Mp4IndexBuilder::video_index`] returns the failure.
pub struct Mp4IndexBuilder {
    file_size: u64,
    /// Absolute offset of the first byte the next `feed` call will supply.
    window_offset: u64,
    done: bool,
    error: Option<IndexError>,

    parsed_ftyp: bool,
    parsed_moov: bool,
    fragments_present: bool,

    track_extends: Vec<TrackExtendsBox>,

    timescale: u32,
    duration: u64,
    width: u32,
    height: u32,
    format: String,
    extradata: Vec<u8>,
    sample_offsets: Vec<u64>,
    sample_sizes: Vec<u64>,
    keyframe_indices: Vec<u64>,
}

impl Mp4IndexBuilder {
    pub fn new(file_size: u64) -> Self {
        Self {
            file_size,
            window_offset: 0,
            done: false,
            error: None,
            parsed_ftyp: false,
            parsed_moov: false,
            fragments_present: false,
            track_extends: Vec::new(),
            timescale: 0,
            duration: 0,
            width: 0,
            height: 0,
            format: String::new(),
            extradata: Vec::new(),
            sample_offsets: Vec::new(),
            sample_sizes: Vec::new(),
            keyframe_indices: Vec::new(),
        }
    }

    /// The window the first `feed` call must supply.
    pub fn initial_request(&self) -> FeedRequest {
        FeedRequest {
            done: false,
            next_offset: 0,
            next_size: READ_AHEAD.min(self.file_size),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done || (self.parsed_ftyp && self.parsed_moov && !self.fragments_present)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }

    /// The finished index, or the terminal error.
    pub fn video_index(&self) -> Result<VideoIndex, IndexError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if !self.is_done() {
            return Err(IndexError::NotFinished);
        }
        Ok(VideoIndex::new(
            self.timescale,
            self.duration,
            self.width,
            self.height,
            self.format.clone(),
            self.sample_offsets.clone(),
            self.sample_sizes.clone(),
            self.keyframe_indices.clone(),
            self.extradata.clone(),
        ))
    }

    /// Consume one window of file bytes. `data` must be the exact window
    /// requested by the previous call (or by [`initial_request`] for the
    /// first one).
    ///
    /// [`initial_request`]: Mp4IndexBuilder::initial_request
    pub fn feed(&mut self, data: &[u8]) -> FeedRequest {
        if self.is_done() {
            return FeedRequest::done();
        }

        let mut pos = 0usize;
        loop {
            let abs = self.window_offset + pos as u64;
            if abs >= self.file_size {
                return self.request_read_ahead(abs);
            }
            let rest = &data[pos..];
            if rest.len() < 16 && (abs + rest.len() as u64) < self.file_size {
                // Not enough buffered to even probe a header.
                return self.request_read_ahead(abs);
            }
            let header = match boxes::probe_box(rest) {
                Ok(h) => h,
                Err(IndexError::UnexpectedEof) => return self.fail(IndexError::TruncatedBox),
                Err(e) => return self.fail(e),
            };
            if header.size == 0 {
                return self.fail(IndexError::Malformed(format!(
                    "box '{}' with zero size",
                    header.box_type
                )));
            }
            debug!(box_type = %header.box_type, size = header.size, offset = abs, "probed box");

            let interesting = (!self.parsed_ftyp && header.box_type == FourCc::FTYP)
                || (!self.parsed_moov && header.box_type == FourCc::MOOV)
                || (self.parsed_moov
                    && self.fragments_present
                    && header.box_type == FourCc::MOOF);

            if !interesting {
                // Jump straight past the box.
                return self.request_read_ahead(abs + header.size);
            }

            if (rest.len() as u64) < header.size {
                // Ask for the entire box at its start offset.
                if abs + header.size > self.file_size {
                    return self.fail(IndexError::TruncatedBox);
                }
                self.window_offset = abs;
                return FeedRequest {
                    done: false,
                    next_offset: abs,
                    next_size: header.size,
                };
            }

            let payload =
                &rest[header.header_len as usize..header.size as usize];
            let result = match header.box_type {
                FourCc::FTYP => self.handle_ftyp(payload),
                FourCc::MOOV => self.handle_moov(payload, abs + header.header_len),
                FourCc::MOOF => self.handle_moof(payload, abs),
                _ => unreachable!(),
            };
            if let Err(e) = result {
                return self.fail(e);
            }
            if self.is_done() {
                self.done = true;
                return FeedRequest::done();
            }
            pos += header.size as usize;
        }
    }

    /// Request `READ_AHEAD` bytes at `offset`, clamped to the file end.
    /// Running out of file is fine once every `moof` has been scanned and
    /// an error otherwise.
    fn request_read_ahead(&mut self, offset: u64) -> FeedRequest {
        let mut size = READ_AHEAD;
        if offset + size > self.file_size {
            size = self.file_size.saturating_sub(offset);
            if size == 0 {
                if self.parsed_ftyp && self.parsed_moov && self.fragments_present {
                    // Finished scanning for moofs.
                    self.done = true;
                    return FeedRequest::done();
                }
                return self.fail(IndexError::EofBeforeComplete);
            }
        }
        self.window_offset = offset;
        FeedRequest {
            done: false,
            next_offset: offset,
            next_size: size,
        }
    }

    fn fail(&mut self, error: IndexError) -> FeedRequest {
        tracing::warn!(%error, "mp4 index builder failed");
        self.error = Some(error);
        self.done = true;
        FeedRequest::done()
    }

    fn handle_ftyp(&mut self, payload: &[u8]) -> Result<(), IndexError> {
        let ftyp = boxes::parse_ftyp(payload)?;
        let supported = ftyp
            .compatible_brands
            .iter()
            .any(|b| matches!(&b.0, b"isom" | b"iso2" | b"avc1"));
        if !supported {
            let brands = ftyp
                .compatible_brands
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(IndexError::UnsupportedBrand(brands));
        }
        self.parsed_ftyp = true;
        Ok(())
    }

    fn handle_moov(&mut self, payload: &[u8], base: u64) -> Result<(), IndexError> {
        // Find the trak whose handler is 'vide'.
        let mut video_trak = None;
        let mut found_any_trak = false;
        for child in boxes::children(payload, base) {
            let child = child?;
            if child.header.box_type != FourCc::TRAK {
                continue;
            }
            found_any_trak = true;
            let mdia = boxes::find_child(child.payload, 0, FourCc::MDIA)?
                .ok_or(IndexError::MissingBox("mdia"))?;
            let hdlr = boxes::find_child(mdia.payload, 0, FourCc::HDLR)?
                .ok_or(IndexError::MissingBox("hdlr"))?;
            if boxes::parse_hdlr(hdlr.payload)? == FourCc::VIDE {
                video_trak = Some(child);
                break;
            }
        }
        if !found_any_trak {
            return Err(IndexError::MissingBox("trak"));
        }
        let trak = video_trak.ok_or(IndexError::NoVideoTrack)?;

        let mdia = boxes::find_child(trak.payload, 0, FourCc::MDIA)?
            .ok_or(IndexError::MissingBox("mdia"))?;
        let mdhd = boxes::find_child(mdia.payload, 0, FourCc::MDHD)?
            .ok_or(IndexError::MissingBox("mdhd"))?;
        let media_header = boxes::parse_mdhd(mdhd.payload)?;
        self.timescale = media_header.timescale;
        self.duration = media_header.duration;

        let minf = boxes::find_child(mdia.payload, 0, FourCc::MINF)?
            .ok_or(IndexError::MissingBox("minf"))?;
        let stbl = boxes::find_child(minf.payload, 0, FourCc::STBL)?
            .ok_or(IndexError::MissingBox("stbl"))?;
        self.excavate_sample_table(stbl.payload)?;

        // mvex marks a fragmented file; capture per-track defaults.
        if let Some(mvex) = boxes::find_child(payload, base, FourCc::MVEX)? {
            self.fragments_present = true;
            for child in boxes::children(mvex.payload, 0) {
                let child = child?;
                match child.header.box_type {
                    FourCc::TREX => self.track_extends.push(boxes::parse_trex(child.payload)?),
                    FourCc::LEVA => return Err(IndexError::Unsupported("leva")),
                    _ => {}
                }
            }
        }

        self.parsed_moov = true;
        debug!(
            samples = self.sample_sizes.len(),
            keyframes = self.keyframe_indices.len(),
            fragmented = self.fragments_present,
            "parsed moov"
        );
        Ok(())
    }

    /// Pull sample sizes, offsets, keyframes, dimensions, and extradata out
    /// of an `stbl` payload.
    fn excavate_sample_table(&mut self, stbl: &[u8]) -> Result<(), IndexError> {
        let sample_size_box = match boxes::find_child(stbl, 0, FourCc::STSZ)? {
            Some(b) => boxes::parse_stsz(b.payload)?,
            None => match boxes::find_child(stbl, 0, FourCc::STZ2)? {
                Some(b) => boxes::parse_stz2(b.payload)?,
                None => return Err(IndexError::MissingBox("stsz")),
            },
        };
        let sample_count = sample_size_box.sample_count as u64;
        let sample_sizes: Vec<u64> = (0..sample_count as usize)
            .map(|i| sample_size_box.size_of(i))
            .collect();

        let stsc = boxes::find_child(stbl, 0, FourCc::STSC)?
            .ok_or(IndexError::MissingBox("stsc"))?;
        let chunk_assignment = boxes::parse_stsc(stsc.payload, sample_count)?;

        let chunk_offsets = match boxes::find_child(stbl, 0, FourCc::STCO)? {
            Some(b) => boxes::parse_stco(b.payload)?,
            None => match boxes::find_child(stbl, 0, FourCc::CO64)? {
                Some(b) => boxes::parse_co64(b.payload)?,
                None => return Err(IndexError::MissingBox("stco")),
            },
        };

        // Walk samples chunk by chunk: a sample sits at its chunk's base
        // offset plus the sizes of the samples before it in that chunk.
        let mut sample_offsets = Vec::with_capacity(sample_sizes.len());
        let mut current_chunk = 0u64;
        let mut current_offset = 0u64;
        for (i, &size) in sample_sizes.iter().enumerate() {
            let chunk = chunk_assignment[i];
            if chunk != current_chunk {
                current_chunk = chunk;
                current_offset = *chunk_offsets
                    .get(chunk as usize - 1)
                    .ok_or_else(|| {
                        IndexError::Malformed(format!(
                            "stsc references chunk {chunk} but only {} offsets present",
                            chunk_offsets.len()
                        ))
                    })?;
            }
            sample_offsets.push(current_offset);
            current_offset += size;
        }

        // Random access points; without stss every sample is one.
        let keyframe_indices = match boxes::find_child(stbl, 0, FourCc::STSS)? {
            Some(b) => boxes::parse_stss(b.payload)?
                .iter()
                .map(|&n| n.saturating_sub(1))
                .collect(),
            None => (0..sample_count).collect(),
        };

        let stsd = boxes::find_child(stbl, 0, FourCc::STSD)?
            .ok_or(IndexError::MissingBox("stsd"))?;
        let entry = boxes::parse_stsd(stsd.payload)?;
        self.width = u32::from(entry.width);
        self.height = u32::from(entry.height);
        self.format = entry.format.as_str().to_owned();
        self.extradata = entry.extradata;

        self.sample_offsets = sample_offsets;
        self.sample_sizes = sample_sizes;
        self.keyframe_indices = keyframe_indices;
        Ok(())
    }

    /// Append the samples described by one `moof`. `moof_start` is the
    /// absolute offset of the box header, which anchors the relative
    /// base-offset modes.
    fn handle_moof(&mut self, payload: &[u8], moof_start: u64) -> Result<(), IndexError> {
        let mut offsets = Vec::new();
        let mut sizes = Vec::new();
        let mut keyframe_flags = Vec::new();

        let mut first_traf = true;
        let mut prev_traf_end = 0u64;
        for child in boxes::children(payload, 0) {
            let child = child?;
            if child.header.box_type != FourCc::TRAF {
                continue;
            }
            let tfhd_box = boxes::find_child(child.payload, 0, FourCc::TFHD)?
                .ok_or(IndexError::MissingBox("tfhd"))?;
            let tfhd = boxes::parse_tfhd(tfhd_box.payload)?;

            let base_offset = match tfhd.base_offset {
                BaseOffset::Provided(offset) => offset,
                BaseOffset::Moof => moof_start,
                BaseOffset::Relative => {
                    if first_traf {
                        moof_start
                    } else {
                        prev_traf_end
                    }
                }
            };

            let trex = self
                .track_extends
                .iter()
                .find(|t| t.track_id == tfhd.track_id)
                .copied()
                .ok_or_else(|| {
                    IndexError::Malformed(format!(
                        "no trex for track {} referenced by tfhd",
                        tfhd.track_id
                    ))
                })?;

            let mut prev_run_end = base_offset;
            for run in boxes::children(child.payload, 0) {
                let run = run?;
                if run.header.box_type != FourCc::TRUN {
                    continue;
                }
                let trun = boxes::parse_trun(run.payload)?;
                let mut offset = match trun.data_offset {
                    Some(delta) => base_offset.wrapping_add_signed(i64::from(delta)),
                    None => prev_run_end,
                };
                for (i, sample) in trun.samples.iter().enumerate() {
                    let size = sample
                        .size
                        .or(tfhd.default_sample_size)
                        .unwrap_or(trex.default_sample_size);
                    let flags = sample
                        .flags
                        .or(if i == 0 { trun.first_sample_flags } else { None })
                        .or(tfhd.default_sample_flags)
                        .unwrap_or(trex.default_sample_flags);
                    // Bit 16 of the flags word is "sample is not a sync
                    // sample".
                    let keyframe = flags & 0x0001_0000 == 0;

                    offsets.push(offset);
                    sizes.push(u64::from(size));
                    keyframe_flags.push(keyframe);
                    offset += u64::from(size);
                }
                prev_run_end = offset;
            }
            prev_traf_end = prev_run_end;
            first_traf = false;
        }

        for ((offset, size), keyframe) in offsets
            .into_iter()
            .zip(sizes.into_iter())
            .zip(keyframe_flags.into_iter())
        {
            if keyframe {
                self.keyframe_indices.push(self.sample_offsets.len() as u64);
            }
            self.sample_offsets.push(offset);
            self.sample_sizes.push(size);
        }
        debug!(
            total_samples = self.sample_sizes.len(),
            offset = moof_start,
            "parsed moof"
        );
        Ok(())
    }
}
