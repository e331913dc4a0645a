//! Experiment tracking sink used by the trainer.
//!
//! [`SummaryWriter`] is the narrow interface the training loop reports
//! through. [`JsonlSummaryWriter`] appends one JSON object per event to an
//! `events.jsonl` file and stores figures as PNG images next to it.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use plotters::prelude::{BitMapBackend, IntoDrawingArea, RGBColor, WHITE};
use serde::Serialize;

use crate::error::{NcaError, Result};

/// Rows rendered by [`plot_batch_grid`].
const MAX_GRID_ROWS: usize = 4;
/// Gap between grid cells in pixels.
const GRID_GAP: usize = 2;

/// Receiver of scalars, text and figures.
pub trait SummaryWriter {
    /// Record a scalar value at a global step.
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    /// Record a block of (markdown) text.
    fn add_text(&mut self, tag: &str, text: &str) -> Result<()>;

    /// Record a rendered figure at a global step.
    fn add_figure(&mut self, tag: &str, figure: &Figure, step: usize) -> Result<()>;
}

/// Rendered RGB image, row-major, 3 bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Figure {
    height: usize,
    width: usize,
    pixels: Vec<u8>,
}

impl Figure {
    /// A white canvas.
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            pixels: vec![255; height * width * 3],
        }
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Raw RGB bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGB value at (`row`, `col`).
    pub fn pixel(&self, row: usize, col: usize) -> [u8; 3] {
        let i = (row * self.width + col) * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    fn set_pixel(&mut self, row: usize, col: usize, rgb: [u8; 3]) {
        let i = (row * self.width + col) * 3;
        self.pixels[i..i + 3].copy_from_slice(&rgb);
    }

    /// Write the figure as a PNG file through the plotters bitmap backend.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Plot`] if the backend cannot draw or encode the
    /// image.
    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let root = BitMapBackend::new(path, (self.width as u32, self.height as u32))
            .into_drawing_area();
        root.fill(&WHITE).map_err(NcaError::plot)?;
        for row in 0..self.height {
            for col in 0..self.width {
                let [r, g, b] = self.pixel(row, col);
                root.draw_pixel((col as i32, row as i32), &RGBColor(r, g, b))
                    .map_err(NcaError::plot)?;
            }
        }
        root.present().map_err(NcaError::plot)
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SummaryEvent<'a> {
    Scalar {
        tag: &'a str,
        value: f64,
        step: usize,
    },
    Text {
        tag: &'a str,
        text: &'a str,
    },
    Figure {
        tag: &'a str,
        step: usize,
        path: &'a str,
    },
}

/// Writes events as JSON lines into a run directory.
pub struct JsonlSummaryWriter {
    dir: PathBuf,
    events: BufWriter<File>,
}

impl JsonlSummaryWriter {
    /// Create `dir` if needed and start a fresh `events.jsonl` in it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let events = BufWriter::new(File::create(dir.join("events.jsonl"))?);
        tracing::info!("Writing summaries to {}", dir.display());
        Ok(Self { dir, events })
    }

    /// Path of the event log.
    pub fn events_path(&self) -> PathBuf {
        self.dir.join("events.jsonl")
    }

    /// Flush buffered events to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.events.flush()?;
        Ok(())
    }

    fn write_event(&mut self, event: &SummaryEvent<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.events, event)?;
        self.events.write_all(b"\n")?;
        Ok(())
    }
}

impl SummaryWriter for JsonlSummaryWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.write_event(&SummaryEvent::Scalar { tag, value, step })
    }

    fn add_text(&mut self, tag: &str, text: &str) -> Result<()> {
        self.write_event(&SummaryEvent::Text { tag, text })
    }

    fn add_figure(&mut self, tag: &str, figure: &Figure, step: usize) -> Result<()> {
        let file_tag: String = tag
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = self
            .dir
            .join("figures")
            .join(format!("{file_tag}_{step:06}.png"));
        figure.save_png(&path)?;
        let path = path.to_string_lossy();
        self.write_event(&SummaryEvent::Figure {
            tag,
            step,
            path: &path,
        })
    }
}

impl Drop for JsonlSummaryWriter {
    fn drop(&mut self) {
        if let Err(err) = self.events.flush() {
            tracing::warn!("Failed to flush summary events: {err}");
        }
    }
}

/// Host copy of one grid column.
struct Panel {
    height: usize,
    width: usize,
    data: Vec<f32>,
    channels: usize,
    shown: usize,
}

impl Panel {
    fn new(t: &Tensor, channels: usize) -> Result<Self> {
        let t = match t.rank() {
            3 => t.unsqueeze(1)?,
            4 => t.clone(),
            _ => {
                return Err(NcaError::shape_mismatch(
                    "(B, C, H, W) or (B, H, W)",
                    format!("{:?}", t.dims()),
                ))
            }
        };
        let (_, c, height, width) = t.dims4()?;
        let data = t
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self {
            height,
            width,
            data,
            channels: c,
            shown: channels.min(c).clamp(1, 3),
        })
    }

    fn rgb(&self, item: usize, row: usize, col: usize) -> [u8; 3] {
        let plane = self.height * self.width;
        let value = |channel: usize| {
            let idx = (item * self.channels + channel) * plane + row * self.width + col;
            (self.data[idx].clamp(0.0, 1.0) * 255.0).round() as u8
        };
        match self.shown {
            1 => {
                let v = value(0);
                [v, v, v]
            }
            2 => [value(0), value(1), 0],
            _ => [value(0), value(1), value(2)],
        }
    }
}

/// Render input, prediction and target side by side, one row per batch
/// item (at most four rows).
///
/// Only the leading `num_image_channels` channels (at most three, shown as
/// RGB) of the input and prediction are drawn; single-channel data is shown
/// in grayscale. Values are clamped to [0, 1].
///
/// # Errors
///
/// Returns an error if a tensor is not rank 3 or 4, or the three tensors
/// disagree in batch or spatial size.
pub fn plot_batch_grid(
    input: &Tensor,
    prediction: &Tensor,
    target: &Tensor,
    num_image_channels: usize,
) -> Result<Figure> {
    let panels = [
        Panel::new(input, num_image_channels)?,
        Panel::new(prediction, num_image_channels)?,
        Panel::new(target, num_image_channels)?,
    ];
    let (h, w) = (panels[0].height, panels[0].width);
    if panels.iter().any(|p| p.height != h || p.width != w) {
        return Err(NcaError::shape_mismatch(
            format!("spatial size {h}x{w}"),
            format!("{:?} / {:?}", prediction.dims(), target.dims()),
        ));
    }
    let batch = input.dim(0)?;
    if prediction.dim(0)? < batch || target.dim(0)? < batch {
        return Err(NcaError::shape_mismatch(
            format!("batch of at least {batch}"),
            format!("{:?} / {:?}", prediction.dims(), target.dims()),
        ));
    }

    let rows = batch.min(MAX_GRID_ROWS);
    let mut figure = Figure::new(
        rows * h + (rows.saturating_sub(1)) * GRID_GAP,
        panels.len() * w + (panels.len() - 1) * GRID_GAP,
    );
    for item in 0..rows {
        let top = item * (h + GRID_GAP);
        for (column, panel) in panels.iter().enumerate() {
            let left = column * (w + GRID_GAP);
            for row in 0..h {
                for col in 0..w {
                    figure.set_pixel(top + row, left + col, panel.rgb(item, row, col));
                }
            }
        }
    }
    Ok(figure)
}
