use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::info;

use strider::{build_segments, DecoderAutomata, DecoderKind};
use turbojpeg::{Compressor, Image, PixelFormat, Subsamp};

use super::{load_or_build_index, parse_frame_list, read_file};
use crate::error::CliError;
use crate::GlobalOpts;

/// Frames decoded per get_frames call.
const BATCH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecoderChoice {
    Software,
    Nvdec,
}

impl From<DecoderChoice> for DecoderKind {
    fn from(choice: DecoderChoice) -> Self {
        match choice {
            DecoderChoice::Software => DecoderKind::Software,
            DecoderChoice::Nvdec => DecoderKind::Nvdec,
        }
    }
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Input MP4 file
    #[arg(short, long)]
    pub input: PathBuf,

    /// Frames to extract, e.g. "0-9,100,250-260" (default: all frames)
    #[arg(short, long)]
    pub frames: Option<String>,

    /// Output directory for JPEG files
    #[arg(short, long, default_value = "./frames")]
    pub output: PathBuf,

    /// Decoder backend
    #[arg(long, value_enum, default_value = "software")]
    pub decoder: DecoderChoice,

    /// GPU index for the nvdec backend
    #[arg(long, default_value = "0")]
    pub gpu: u32,

    /// JPEG quality (1-100)
    #[arg(long, default_value = "90")]
    pub quality: u8,
}

pub fn run(global: &GlobalOpts, args: ExtractArgs) -> Result<()> {
    let video = read_file(&args.input)?;
    let index = load_or_build_index(&args.input, &video)?;

    let desired = match &args.frames {
        Some(spec) => parse_frame_list(spec, index.frames())?,
        None => (0..index.frames()).collect(),
    };
    if desired.is_empty() {
        return Err(CliError::EmptyVideo.into());
    }
    info!(
        frames = desired.len(),
        decoder = ?args.decoder,
        "extracting frames"
    );

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;

    let segments = build_segments(&index, video, &desired)?;
    let mut automata = DecoderAutomata::new(args.decoder.into(), args.gpu, 1)?;
    automata.initialize(segments, index.metadata_bytes())?;

    let mut compressor = Compressor::new().context("failed to create JPEG compressor")?;
    compressor
        .set_quality(i32::from(args.quality.clamp(1, 100)))
        .context("failed to set JPEG quality")?;
    compressor
        .set_subsamp(Subsamp::Sub2x2)
        .context("failed to set subsampling")?;

    let progress = if global.no_progress {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(desired.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} frames {elapsed_precise}")
                .expect("static progress template"),
        );
        bar
    };

    let width = index.frame_width() as usize;
    let height = index.frame_height() as usize;
    let frame_size = index.frame_size();
    let mut buffer = vec![0u8; BATCH * frame_size];
    let mut written = 0usize;

    while written < desired.len() {
        let n = BATCH.min(desired.len() - written);
        automata.get_frames(&mut buffer[..n * frame_size], n)?;
        write_jpeg_batch(
            &mut compressor,
            &buffer[..n * frame_size],
            &desired[written..written + n],
            width,
            height,
            &args.output,
        )?;
        written += n;
        progress.inc(n as u64);
    }
    progress.finish_and_clear();

    if global.json {
        println!(
            "{}",
            serde_json::json!({
                "frames_written": written,
                "output": args.output.display().to_string(),
            })
        );
    } else {
        println!(
            "Wrote {} frames to {}",
            written,
            args.output.display()
        );
    }
    Ok(())
}

/// Compress a batch of packed RGB24 frames and write one JPEG per frame,
/// named by source frame number.
fn write_jpeg_batch(
    compressor: &mut Compressor,
    buffer: &[u8],
    frame_numbers: &[u64],
    width: usize,
    height: usize,
    output: &Path,
) -> Result<()> {
    let frame_size = width * height * 3;
    for (i, &frame_number) in frame_numbers.iter().enumerate() {
        let image = Image {
            pixels: &buffer[i * frame_size..(i + 1) * frame_size],
            width,
            pitch: width * 3,
            height,
            format: PixelFormat::RGB,
        };
        let jpeg = compressor
            .compress_to_vec(image)
            .context("JPEG compression failed")?;
        let path = output.join(format!("frame_{frame_number:06}.jpg"));
        std::fs::write(&path, &jpeg)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
