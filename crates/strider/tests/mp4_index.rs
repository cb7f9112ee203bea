//! End-to-end index builder tests over synthetic MP4 files.
//!
//! The fixtures are assembled box by box in memory, so the tests cover the
//! full feed protocol (window requests, whole-box reads, skip-ahead) on
//! both classic and fragmented layouts without any fixture files.

use strider::{slice_into_video_intervals, Mp4IndexBuilder, VideoIndex};

const AVCC: &[u8] = &[1, 0x64, 0x00, 0x1F, 0xFC | 3, 0xE0, 0x00];

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

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

fn ftyp(brands: &[&[u8; 4]]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"isom");
    payload.extend_from_slice(&0x200u32.to_be_bytes());
    for brand in brands {
        payload.extend_from_slice(*brand);
    }
    boxed(b"ftyp", &payload)
}

fn mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut body = vec![0u8; 8];
    body.extend_from_slice(&timescale.to_be_bytes());
    body.extend_from_slice(&duration.to_be_bytes());
    body.extend_from_slice(&[0u8; 4]); // language, pre_defined
    full_boxed(b"mdhd", 0, 0, &body)
}

fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let mut body = vec![0u8; 4];
    body.extend_from_slice(handler);
    body.extend_from_slice(&[0u8; 12]);
    full_boxed(b"hdlr", 0, 0, &body)
}

fn avc1_entry(width: u16, height: u16) -> Vec<u8> {
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
    entry.extend_from_slice(&boxed(b"avcC", AVCC));
    boxed(b"avc1", &entry)
}

fn stsd() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u32.to_be_bytes());
    body.extend_from_slice(&avc1_entry(64, 48));
    full_boxed(b"stsd", 0, 0, &body)
}

/// stbl for the classic fixture. `chunk_offsets` must already account for
/// the final file layout.
fn stbl_classic(sample_sizes: &[u32], stsc_runs: &[(u32, u32)], chunk_offsets: &[u32],
    sync_samples: &[u32]) -> Vec<u8> {
    let mut stsz_body = Vec::new();
    stsz_body.extend_from_slice(&0u32.to_be_bytes());
    stsz_body.extend_from_slice(&(sample_sizes.len() as u32).to_be_bytes());
    stsz_body.extend_from_slice(&u32s(sample_sizes));

    let mut stsc_body = Vec::new();
    stsc_body.extend_from_slice(&(stsc_runs.len() as u32).to_be_bytes());
    for &(first, per) in stsc_runs {
        stsc_body.extend_from_slice(&u32s(&[first, per, 1]));
    }

    let mut stco_body = Vec::new();
    stco_body.extend_from_slice(&(chunk_offsets.len() as u32).to_be_bytes());
    stco_body.extend_from_slice(&u32s(chunk_offsets));

    let mut stss_body = Vec::new();
    stss_body.extend_from_slice(&(sync_samples.len() as u32).to_be_bytes());
    stss_body.extend_from_slice(&u32s(sync_samples));

    let mut stbl = Vec::new();
    stbl.extend_from_slice(&stsd());
    stbl.extend_from_slice(&full_boxed(b"stsz", 0, 0, &stsz_body));
    stbl.extend_from_slice(&full_boxed(b"stsc", 0, 0, &stsc_body));
    stbl.extend_from_slice(&full_boxed(b"stco", 0, 0, &stco_body));
    stbl.extend_from_slice(&full_boxed(b"stss", 0, 0, &stss_body));
    boxed(b"stbl", &stbl)
}

fn video_trak(stbl: Vec<u8>) -> Vec<u8> {
    let mut minf = Vec::new();
    minf.extend_from_slice(&stbl);
    let minf = boxed(b"minf", &minf);

    let mut mdia = Vec::new();
    mdia.extend_from_slice(&mdhd(15360, 122_880));
    mdia.extend_from_slice(&hdlr(b"vide"));
    mdia.extend_from_slice(&minf);
    boxed(b"trak", &boxed(b"mdia", &mdia))
}

fn sound_trak() -> Vec<u8> {
    let mut mdia = Vec::new();
    mdia.extend_from_slice(&mdhd(48000, 96000));
    mdia.extend_from_slice(&hdlr(b"soun"));
    boxed(b"trak", &boxed(b"mdia", &mdia))
}

/// Classic layout: ftyp, mdat, moov (sample table at the end, like a
/// non-faststart encode). Returns the file plus the expected per-sample
/// offsets.
fn classic_file() -> (Vec<u8>, Vec<u32>, Vec<u64>) {
    let sample_sizes: Vec<u32> = (0..8).map(|i| 100 + i).collect();
    // Chunks 1-2 hold three samples, chunk 3 the remaining two.
    let stsc_runs = [(1u32, 3u32), (3, 2)];
    let sync_samples = [1u32, 5];

    let ftyp = ftyp(&[b"isom", b"avc1"]);
    let mdat_payload_len: u32 = sample_sizes.iter().sum();
    let mdat_payload_start = ftyp.len() as u32 + 8;

    let chunk_offsets = vec![
        mdat_payload_start,
        mdat_payload_start + (100 + 101 + 102),
        mdat_payload_start + (100 + 101 + 102) + (103 + 104 + 105),
    ];

    let mut expected_offsets = Vec::new();
    let chunk_starts = [0usize, 3, 6];
    for (c, &start) in chunk_starts.iter().enumerate() {
        let mut offset = u64::from(chunk_offsets[c]);
        let end = if c == 2 { 8 } else { start + 3 };
        for i in start..end {
            expected_offsets.push(offset);
            offset += u64::from(sample_sizes[i]);
        }
    }

    let stbl = stbl_classic(&sample_sizes, &stsc_runs, &chunk_offsets, &sync_samples);
    let mut moov = Vec::new();
    moov.extend_from_slice(&sound_trak());
    moov.extend_from_slice(&video_trak(stbl));
    let moov = boxed(b"moov", &moov);

    let mut file = Vec::new();
    file.extend_from_slice(&ftyp);
    file.extend_from_slice(&boxed(b"mdat", &vec![0xAB; mdat_payload_len as usize]));
    file.extend_from_slice(&moov);
    (file, sample_sizes, expected_offsets)
}

fn build_index(file: &[u8]) -> Result<VideoIndex, String> {
    let mut builder = Mp4IndexBuilder::new(file.len() as u64);
    let mut request = builder.initial_request();
    let mut iterations = 0;
    while !builder.is_done() {
        let start = request.next_offset as usize;
        let end = start + request.next_size as usize;
        assert!(end <= file.len(), "builder requested past EOF: {request:?}");
        request = builder.feed(&file[start..end]);
        iterations += 1;
        assert!(iterations < 10_000, "builder did not converge");
    }
    builder.video_index().map_err(|e| e.to_string())
}

#[test]
fn test_classic_file_index() {
    let (file, sizes, offsets) = classic_file();
    let index = build_index(&file).unwrap();

    assert_eq!(index.frames(), 8);
    assert_eq!(index.frame_width(), 64);
    assert_eq!(index.frame_height(), 48);
    assert_eq!(index.format(), "avc1");
    assert_eq!(index.timescale(), 15360);
    assert_eq!(index.duration(), 122_880);
    assert_eq!(index.metadata_bytes(), AVCC);
    assert_eq!(
        index.sample_sizes(),
        sizes.iter().map(|&s| u64::from(s)).collect::<Vec<_>>()
    );
    assert_eq!(index.sample_offsets(), offsets);
    // stss entries are 1-based: samples 1 and 5 are keyframes 0 and 4.
    assert_eq!(index.keyframe_indices(), &[0, 4]);
}

#[test]
fn test_classic_index_offsets_inside_file() {
    let (file, _, _) = classic_file();
    let index = build_index(&file).unwrap();
    for (&offset, &size) in index.sample_offsets().iter().zip(index.sample_sizes()) {
        assert!(offset + size <= file.len() as u64);
    }
    // Samples within a chunk are adjacent.
    assert_eq!(
        index.sample_offsets()[1],
        index.sample_offsets()[0] + index.sample_sizes()[0]
    );
}

#[test]
fn test_index_round_trip() {
    let (file, _, _) = classic_file();
    let index = build_index(&file).unwrap();
    let restored = VideoIndex::deserialize(&index.serialize()).unwrap();
    assert_eq!(restored, index);
}

#[test]
fn test_slicer_on_built_index_starts_on_keyframes() {
    let (file, _, _) = classic_file();
    let index = build_index(&file).unwrap();
    let intervals = slice_into_video_intervals(&index, &[1, 2, 6]);
    for interval in &intervals {
        assert!(index.keyframe_indices().contains(&interval.start_keyframe));
    }
    let total: usize = intervals.iter().map(|i| i.valid_frames.len()).sum();
    assert_eq!(total, 3);
}

#[test]
fn test_truncated_file_reports_eof_in_box() {
    let (file, _, _) = classic_file();
    let truncated = &file[..file.len() - 16];
    let mut builder = Mp4IndexBuilder::new(truncated.len() as u64);
    let mut request = builder.initial_request();
    while !builder.is_done() {
        let start = request.next_offset as usize;
        let end = (start + request.next_size as usize).min(truncated.len());
        request = builder.feed(&truncated[start..end]);
    }
    assert!(builder.is_error());
    assert_eq!(
        builder.error_message().as_deref(),
        Some("EOF in middle of box")
    );
    assert!(builder.video_index().is_err());
}

#[test]
fn test_unsupported_brands_rejected() {
    let mut file = ftyp(&[b"qt  ", b"mp41"]);
    file.extend_from_slice(&boxed(b"mdat", &[0u8; 32]));
    let mut builder = Mp4IndexBuilder::new(file.len() as u64);
    let request = builder.initial_request();
    let _ = builder.feed(&file[..request.next_size as usize]);
    assert!(builder.is_error());
    assert!(builder
        .error_message()
        .unwrap()
        .starts_with("No supported mp4 brands"));
}

#[test]
fn test_missing_video_track_rejected() {
    let mut moov = Vec::new();
    moov.extend_from_slice(&sound_trak());
    let moov = boxed(b"moov", &moov);
    let mut file = ftyp(&[b"isom"]);
    file.extend_from_slice(&moov);
    let err = build_index(&file).unwrap_err();
    assert!(err.contains("video trak"), "unexpected error: {err}");
}

// ---------------------------------------------------------------------------
// Fragmented layout
// ---------------------------------------------------------------------------

const NOT_SYNC: u32 = 0x0001_0000;

/// Empty sample table for a fragmented moov.
fn stbl_fragmented() -> Vec<u8> {
    let mut stbl = Vec::new();
    stbl.extend_from_slice(&stsd());
    stbl.extend_from_slice(&full_boxed(b"stsz", 0, 0, &u32s(&[0, 0])));
    stbl.extend_from_slice(&full_boxed(b"stsc", 0, 0, &u32s(&[0])));
    stbl.extend_from_slice(&full_boxed(b"stco", 0, 0, &u32s(&[0])));
    boxed(b"stbl", &stbl)
}

fn trex(track_id: u32, default_flags: u32) -> Vec<u8> {
    full_boxed(b"trex", 0, 0, &u32s(&[track_id, 1, 512, 0, default_flags]))
}

fn moov_fragmented(extra_mvex_child: Option<Vec<u8>>) -> Vec<u8> {
    let mut mvex = trex(1, NOT_SYNC);
    if let Some(child) = extra_mvex_child {
        mvex.extend_from_slice(&child);
    }
    let mut moov = Vec::new();
    moov.extend_from_slice(&video_trak(stbl_fragmented()));
    moov.extend_from_slice(&boxed(b"mvex", &mvex));
    boxed(b"moov", &moov)
}

/// First fragment: default-base-is-moof, per-sample sizes in the trun,
/// keyframe via first_sample_flags.
fn moof_one() -> Vec<u8> {
    let build = |data_offset: i32| -> Vec<u8> {
        let tfhd = full_boxed(b"tfhd", 0, 0x0002_0000 | 0x20, &u32s(&[1, NOT_SYNC]));
        let mut trun_body = Vec::new();
        trun_body.extend_from_slice(&3u32.to_be_bytes());
        trun_body.extend_from_slice(&data_offset.to_be_bytes());
        trun_body.extend_from_slice(&0u32.to_be_bytes()); // first_sample_flags: sync
        trun_body.extend_from_slice(&u32s(&[50, 60, 70]));
        let trun = full_boxed(b"trun", 0, 0x1 | 0x4 | 0x200, &trun_body);
        let mut traf = tfhd;
        traf.extend_from_slice(&trun);
        boxed(b"moof", &boxed(b"traf", &traf))
    };
    let len = build(0).len() as i32;
    build(len + 8)
}

/// Second fragment: relative base, two truns; the second trun has no data
/// offset (continues after the first) and inherits size and flags from the
/// tfhd defaults.
fn moof_two() -> Vec<u8> {
    let build = |data_offset: i32| -> Vec<u8> {
        let tfhd = full_boxed(b"tfhd", 0, 0x10 | 0x20, &u32s(&[1, 45, NOT_SYNC]));
        let mut trun1_body = Vec::new();
        trun1_body.extend_from_slice(&1u32.to_be_bytes());
        trun1_body.extend_from_slice(&data_offset.to_be_bytes());
        trun1_body.extend_from_slice(&0u32.to_be_bytes()); // sync
        trun1_body.extend_from_slice(&u32s(&[40]));
        let trun1 = full_boxed(b"trun", 0, 0x1 | 0x4 | 0x200, &trun1_body);
        let trun2 = full_boxed(b"trun", 0, 0, &1u32.to_be_bytes());
        let mut traf = tfhd;
        traf.extend_from_slice(&trun1);
        traf.extend_from_slice(&trun2);
        boxed(b"moof", &boxed(b"traf", &traf))
    };
    let len = build(0).len() as i32;
    build(len + 8)
}

fn fragmented_file() -> (Vec<u8>, u64, u64) {
    let mut file = ftyp(&[b"iso2"]);
    file.extend_from_slice(&moov_fragmented(None));

    let moof1 = moof_one();
    let moof1_start = file.len() as u64;
    let moof1_len = moof1.len();
    file.extend_from_slice(&moof1);
    file.extend_from_slice(&boxed(b"mdat", &vec![0xCD; 50 + 60 + 70]));

    let moof2 = moof_two();
    let moof2_start = file.len() as u64;
    let moof2_len = moof2.len();
    file.extend_from_slice(&moof2);
    file.extend_from_slice(&boxed(b"mdat", &vec![0xEF; 40 + 45]));

    (
        file,
        moof1_start + moof1_len as u64 + 8,
        moof2_start + moof2_len as u64 + 8,
    )
}

#[test]
fn test_fragmented_file_index() {
    let (file, data1, data2) = fragmented_file();
    let index = build_index(&file).unwrap();

    assert_eq!(index.frames(), 5);
    assert_eq!(index.format(), "avc1");
    assert_eq!(index.sample_sizes(), &[50, 60, 70, 40, 45]);
    assert_eq!(
        index.sample_offsets(),
        &[data1, data1 + 50, data1 + 110, data2, data2 + 40]
    );
    // Samples 0 and 3 carried sync flags.
    assert_eq!(index.keyframe_indices(), &[0, 3]);
    // Extradata still comes from the moov sample description.
    assert_eq!(index.metadata_bytes(), AVCC);
}

#[test]
fn test_fragmented_offsets_point_into_mdat() {
    let (file, _, _) = fragmented_file();
    let index = build_index(&file).unwrap();
    for (&offset, &size) in index.sample_offsets().iter().zip(index.sample_sizes()) {
        let sample = &file[offset as usize..(offset + size) as usize];
        assert!(sample.iter().all(|&b| b == 0xCD || b == 0xEF));
    }
}

#[test]
fn test_leva_rejected() {
    let mut file = ftyp(&[b"isom"]);
    file.extend_from_slice(&moov_fragmented(Some(full_boxed(b"leva", 0, 0, &[0, 0, 0, 0]))));
    let mut builder = Mp4IndexBuilder::new(file.len() as u64);
    let mut request = builder.initial_request();
    while !builder.is_done() {
        let start = request.next_offset as usize;
        let end = (start + request.next_size as usize).min(file.len());
        request = builder.feed(&file[start..end]);
    }
    assert!(builder.is_error());
    assert_eq!(builder.error_message().as_deref(), Some("'leva' not supported"));
}

#[test]
fn test_moov_larger_than_read_ahead_requested_whole() {
    // Faststart layout with 300 samples: the moov overflows the initial
    // 1024-byte window, so the builder must come back and ask for the
    // whole box at its start offset.
    let sample_sizes: Vec<u32> = vec![10; 300];
    let ftyp = ftyp(&[b"isom"]);

    let build_moov = |chunk_offset: u32| {
        let stbl = stbl_classic(&sample_sizes, &[(1, 300)], &[chunk_offset], &[1]);
        boxed(b"moov", &video_trak(stbl))
    };
    let moov_len = build_moov(0).len();
    assert!(moov_len > 1024, "fixture must not fit the first window");
    let mdat_payload_start = (ftyp.len() + moov_len + 8) as u32;
    let moov = build_moov(mdat_payload_start);

    let mut file = Vec::new();
    file.extend_from_slice(&ftyp);
    file.extend_from_slice(&moov);
    file.extend_from_slice(&boxed(b"mdat", &vec![0u8; 3000]));

    let index = build_index(&file).unwrap();
    assert_eq!(index.frames(), 300);
    assert_eq!(index.sample_offsets()[0], u64::from(mdat_payload_start));
    assert_eq!(index.sample_offsets()[299], u64::from(mdat_payload_start) + 2990);
    assert_eq!(index.keyframe_indices(), &[0]);
}
