//! The interpolation capability: synthesize the frame at `time` between two
//! anchor frames.
//!
//! Implementations are blocking and CPU/GPU heavy. [`InterpolatorPool`] runs
//! them on the blocking thread pool and caps the number of calls in flight to
//! the configured model instance count.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Result};
use image::{DynamicImage, ImageFormat, RgbaImage};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;
use uuid::Uuid;

use crate::config::{InterpolatorConfig, InterpolatorKind};

#[derive(Debug, Error)]
pub enum InterpolationError {
    #[error("failed to decode {side} frame: {source}")]
    Decode {
        side: &'static str,
        #[source]
        source: image::ImageError,
    },

    #[error("neighbor frames differ in size: {before:?} vs {after:?}")]
    DimensionMismatch { before: (u32, u32), after: (u32, u32) },

    #[error("failed to encode interpolated frame: {0}")]
    Encode(#[source] image::ImageError),

    #[error("interpolation command failed: {0}")]
    Command(String),

    #[error("interpolation aborted: {0}")]
    Aborted(String),
}

/// Owned inputs for one interpolation call.
#[derive(Debug, Clone)]
pub struct InterpolationInput {
    pub before: Vec<u8>,
    pub after: Vec<u8>,
    /// Position of the target between `before` (0.0) and `after` (1.0).
    pub time: f32,
    /// File extension of the frame being replaced; the output is encoded to match.
    pub extension: String,
}

pub trait FrameInterpolator: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn interpolate(&self, input: &InterpolationInput) -> Result<Vec<u8>, InterpolationError>;
}

/// Linear cross-fade of the two anchors. Stands in for a learned model.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlendInterpolator;

impl FrameInterpolator for BlendInterpolator {
    fn name(&self) -> &str {
        "blend"
    }

    fn interpolate(&self, input: &InterpolationInput) -> Result<Vec<u8>, InterpolationError> {
        let before = decode_rgba(&input.before, "before")?;
        let after = decode_rgba(&input.after, "after")?;
        if before.dimensions() != after.dimensions() {
            return Err(InterpolationError::DimensionMismatch {
                before: before.dimensions(),
                after: after.dimensions(),
            });
        }

        let t = input.time.clamp(0.0, 1.0);
        let (width, height) = before.dimensions();
        let mut blended = RgbaImage::new(width, height);
        for ((out, a), b) in blended
            .pixels_mut()
            .zip(before.pixels())
            .zip(after.pixels())
        {
            for channel in 0..4 {
                let mixed = f32::from(a[channel]) * (1.0 - t) + f32::from(b[channel]) * t;
                out[channel] = mixed.round().clamp(0.0, 255.0) as u8;
            }
        }

        encode_like(DynamicImage::ImageRgba8(blended), &input.extension)
    }
}

/// Runs an external program per frame. Arguments are templated with
/// `{before}`, `{after}`, `{output}` (file paths) and `{time}`.
#[derive(Debug, Clone)]
pub struct CommandInterpolator {
    program: String,
    args: Vec<String>,
    scratch_root: PathBuf,
}

impl CommandInterpolator {
    pub fn new(template: &[String]) -> Result<Self> {
        let Some((program, args)) = template.split_first() else {
            bail!("interpolator.command must name a program when kind = \"command\"");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            scratch_root: std::env::temp_dir(),
        })
    }

    pub fn with_scratch_root(mut self, scratch_root: PathBuf) -> Self {
        self.scratch_root = scratch_root;
        self
    }

    fn render_args(&self, before: &Path, after: &Path, output: &Path, time: f32) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{before}", &before.to_string_lossy())
                    .replace("{after}", &after.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{time}", &format!("{time:.6}"))
            })
            .collect()
    }

    fn run_in(
        &self,
        scratch: &Path,
        input: &InterpolationInput,
    ) -> Result<Vec<u8>, InterpolationError> {
        let io_err = |what: &str, err: std::io::Error| {
            InterpolationError::Command(format!("{what}: {err}"))
        };

        fs::create_dir_all(scratch).map_err(|e| io_err("failed to create scratch dir", e))?;
        let ext = input.extension.as_str();
        let before = scratch.join(format!("before.{ext}"));
        let after = scratch.join(format!("after.{ext}"));
        let output = scratch.join(format!("output.{ext}"));
        fs::write(&before, &input.before).map_err(|e| io_err("failed to stage before frame", e))?;
        fs::write(&after, &input.after).map_err(|e| io_err("failed to stage after frame", e))?;

        let args = self.render_args(&before, &after, &output, input.time);
        debug!(program = %self.program, ?args, "Running interpolation command");
        let result = crate::runtime::command_for(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| io_err(&format!("failed to execute {}", self.program), e))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(InterpolationError::Command(format!(
                "{} exited with status {}: {}",
                self.program,
                result.status,
                stderr.trim()
            )));
        }

        fs::read(&output).map_err(|e| io_err("command produced no output frame", e))
    }
}

impl FrameInterpolator for CommandInterpolator {
    fn name(&self) -> &str {
        &self.program
    }

    fn interpolate(&self, input: &InterpolationInput) -> Result<Vec<u8>, InterpolationError> {
        let scratch = self
            .scratch_root
            .join(format!("framefix-interp-{}", Uuid::new_v4()));
        let result = self.run_in(&scratch, input);
        let _ = fs::remove_dir_all(&scratch);
        result
    }
}

/// Command interpolators stage their temp files under `scratch_root`.
pub fn build_interpolator(
    config: &InterpolatorConfig,
    scratch_root: &Path,
) -> Result<Arc<dyn FrameInterpolator>> {
    Ok(match config.kind {
        InterpolatorKind::Blend => Arc::new(BlendInterpolator),
        InterpolatorKind::Command => Arc::new(
            CommandInterpolator::new(&config.command)?
                .with_scratch_root(scratch_root.to_path_buf()),
        ),
    })
}

/// Capped pool of interpolation slots shared by every worker.
#[derive(Clone)]
pub struct InterpolatorPool {
    interpolator: Arc<dyn FrameInterpolator>,
    slots: Arc<Semaphore>,
    instances: usize,
}

impl InterpolatorPool {
    pub fn new(interpolator: Arc<dyn FrameInterpolator>, instances: usize) -> Self {
        let instances = instances.max(1);
        Self {
            interpolator,
            slots: Arc::new(Semaphore::new(instances)),
            instances,
        }
    }

    pub fn name(&self) -> &str {
        self.interpolator.name()
    }

    pub fn instances(&self) -> usize {
        self.instances
    }

    /// Waits for a free slot, then runs the interpolator off the async runtime.
    pub async fn interpolate(
        &self,
        input: InterpolationInput,
    ) -> Result<Vec<u8>, InterpolationError> {
        let _permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| InterpolationError::Aborted("interpolator pool closed".to_string()))?;

        let interpolator = Arc::clone(&self.interpolator);
        tokio::task::spawn_blocking(move || interpolator.interpolate(&input))
            .await
            .map_err(|err| {
                InterpolationError::Aborted(format!("interpolation task failed: {err}"))
            })?
    }
}

fn decode_rgba(bytes: &[u8], side: &'static str) -> Result<RgbaImage, InterpolationError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|source| InterpolationError::Decode { side, source })
}

fn encode_like(img: DynamicImage, extension: &str) -> Result<Vec<u8>, InterpolationError> {
    let format = ImageFormat::from_extension(extension).unwrap_or(ImageFormat::Png);
    // JPEG and BMP encoders here take RGB only.
    let img = match format {
        ImageFormat::Jpeg | ImageFormat::Bmp => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img,
    };

    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format)
        .map_err(InterpolationError::Encode)?;
    Ok(buf.into_inner())
}
