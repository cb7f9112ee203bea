pub mod extract;
pub mod index;
pub mod info;

use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::Path;

use strider::{Mp4IndexBuilder, VideoIndex};

use crate::error::CliError;

/// Default extension for serialized index files.
pub const INDEX_EXTENSION: &str = "vidx";

/// Read a whole file as shared bytes.
pub fn read_file(path: &Path) -> Result<Bytes> {
    if !path.exists() {
        return Err(CliError::FileNotFound(path.display().to_string()).into());
    }
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Bytes::from(data))
}

/// Stream `video` through the resumable builder the way a remote reader
/// would: hand over exactly the windows it asks for.
pub fn index_video(video: &Bytes) -> Result<VideoIndex> {
    let mut builder = Mp4IndexBuilder::new(video.len() as u64);
    let mut request = builder.initial_request();
    while !builder.is_done() {
        let start = request.next_offset as usize;
        let end = start + request.next_size as usize;
        let window = video
            .get(start..end)
            .ok_or_else(|| CliError::Index(format!("builder requested {start}..{end}")))?;
        request = builder.feed(window);
    }
    let index = builder
        .video_index()
        .map_err(|e| CliError::Index(e.to_string()))?;
    tracing::debug!(
        frames = index.frames(),
        keyframes = index.keyframe_indices().len(),
        "built video index"
    );
    Ok(index)
}

/// Load an index from `<video>.vidx` if present, otherwise build it from
/// the video bytes.
pub fn load_or_build_index(video_path: &Path, video: &Bytes) -> Result<VideoIndex> {
    let index_path = video_path.with_extension(INDEX_EXTENSION);
    if index_path.exists() {
        let data = std::fs::read(&index_path)
            .with_context(|| format!("failed to read {}", index_path.display()))?;
        let index = VideoIndex::deserialize(&data)
            .map_err(|e| CliError::Index(e.to_string()))?;
        tracing::debug!(path = %index_path.display(), "loaded cached index");
        return Ok(index);
    }
    index_video(video)
}

/// Parse a frame-list expression: comma-separated frame numbers and
/// inclusive ranges, e.g. `0-9,100,250-260`.
pub fn parse_frame_list(spec: &str, frames: u64) -> Result<Vec<u64>, CliError> {
    let mut out = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => {
                let start = a
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| CliError::InvalidFrameList(part.to_owned()))?;
                let end = b
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| CliError::InvalidFrameList(part.to_owned()))?;
                (start, end)
            }
            None => {
                let frame = part
                    .parse::<u64>()
                    .map_err(|_| CliError::InvalidFrameList(part.to_owned()))?;
                (frame, frame)
            }
        };
        if start > end {
            return Err(CliError::InvalidFrameList(part.to_owned()));
        }
        out.extend(start..=end);
    }
    if out.is_empty() {
        return Err(CliError::InvalidFrameList(spec.to_owned()));
    }
    out.sort_unstable();
    out.dedup();
    if let Some(&last) = out.last() {
        if last >= frames {
            return Err(CliError::FrameOutOfRange { frame: last, frames });
        }
    }
    Ok(out)
}
