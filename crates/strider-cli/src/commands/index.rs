use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;

use super::{index_video, read_file, INDEX_EXTENSION};
use crate::GlobalOpts;

#[derive(Args, Debug)]
pub struct IndexArgs {
    /// Input MP4 file
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output index path (defaults to the input with a .vidx extension)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Serialize)]
struct IndexSummary {
    output: String,
    frames: u64,
    keyframes: usize,
    width: u32,
    height: u32,
    format: String,
    index_bytes: usize,
}

pub fn run(global: &GlobalOpts, args: IndexArgs) -> Result<()> {
    let video = read_file(&args.input)?;
    let index = index_video(&video)?;

    let output = args
        .output
        .unwrap_or_else(|| args.input.with_extension(INDEX_EXTENSION));
    let serialized = index.serialize();
    std::fs::write(&output, &serialized)
        .with_context(|| format!("failed to write {}", output.display()))?;

    let summary = IndexSummary {
        output: output.display().to_string(),
        frames: index.frames(),
        keyframes: index.keyframe_indices().len(),
        width: index.frame_width(),
        height: index.frame_height(),
        format: index.format().to_owned(),
        index_bytes: serialized.len(),
    };
    if global.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Indexed {} frames ({} keyframes, {}x{} {}) -> {} ({} bytes)",
            summary.frames,
            summary.keyframes,
            summary.width,
            summary.height,
            summary.format,
            summary.output,
            summary.index_bytes,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures;
    use strider::VideoIndex;
    use tempfile::TempDir;

    fn global() -> crate::GlobalOpts {
        crate::GlobalOpts {
            json: true,
            verbose: 0,
            no_progress: true,
        }
    }

    #[test]
    fn test_index_command_writes_sidecar() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mp4");
        std::fs::write(&input, fixtures::sample_mp4()).unwrap();

        run(
            &global(),
            IndexArgs {
                input: input.clone(),
                output: None,
            },
        )
        .unwrap();

        let data = std::fs::read(input.with_extension(INDEX_EXTENSION)).unwrap();
        let index = VideoIndex::deserialize(&data).unwrap();
        assert_eq!(index.frames(), fixtures::FRAME_COUNT);
        assert_eq!(index.keyframe_indices(), &[0, 2]);
    }

    #[test]
    fn test_index_command_explicit_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mp4");
        let output = dir.path().join("cache").with_extension(INDEX_EXTENSION);
        std::fs::write(&input, fixtures::sample_mp4()).unwrap();

        run(
            &global(),
            IndexArgs {
                input,
                output: Some(output.clone()),
            },
        )
        .unwrap();

        let index = VideoIndex::deserialize(&std::fs::read(output).unwrap()).unwrap();
        assert_eq!(index.timescale(), fixtures::TIMESCALE);
    }

    #[test]
    fn test_index_command_missing_input() {
        let dir = TempDir::new().unwrap();
        let result = run(
            &global(),
            IndexArgs {
                input: dir.path().join("absent.mp4"),
                output: None,
            },
        );
        assert!(result.is_err());
    }
}
