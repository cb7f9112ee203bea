use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;

use strider::VideoIndex;

use super::{load_or_build_index, read_file};
use crate::GlobalOpts;

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Input MP4 file (a cached .vidx next to it is used when present)
    #[arg(short, long)]
    pub input: PathBuf,
}

#[derive(Serialize)]
struct InfoSummary {
    frames: u64,
    keyframes: usize,
    width: u32,
    height: u32,
    format: String,
    timescale: u32,
    duration: u64,
    duration_seconds: f64,
    extradata_bytes: usize,
    mean_gop_length: f64,
}

fn summarize(index: &VideoIndex) -> InfoSummary {
    let keyframes = index.keyframe_indices().len();
    let duration_seconds = if index.timescale() > 0 {
        index.duration() as f64 / f64::from(index.timescale())
    } else {
        0.0
    };
    InfoSummary {
        frames: index.frames(),
        keyframes,
        width: index.frame_width(),
        height: index.frame_height(),
        format: index.format().to_owned(),
        timescale: index.timescale(),
        duration: index.duration(),
        duration_seconds,
        extradata_bytes: index.metadata_bytes().len(),
        mean_gop_length: if keyframes > 0 {
            index.frames() as f64 / keyframes as f64
        } else {
            0.0
        },
    }
}

pub fn run(global: &GlobalOpts, args: InfoArgs) -> Result<()> {
    let video = read_file(&args.input)?;
    let index = load_or_build_index(&args.input, &video)?;
    let summary = summarize(&index);

    if global.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}x{} {}", summary.width, summary.height, summary.format);
        println!(
            "{} frames, {} keyframes (mean GOP {:.1})",
            summary.frames, summary.keyframes, summary.mean_gop_length
        );
        println!(
            "duration {:.2}s ({} @ timescale {})",
            summary.duration_seconds, summary.duration, summary.timescale
        );
        println!("extradata {} bytes", summary.extradata_bytes);
    }
    Ok(())
}
