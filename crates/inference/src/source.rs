use crate::detection::FrameMeta;
use anyhow::{Context, Result};
use preprocess::{Frame, PixelFormat};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Image file extensions the source picks up from a directory.
pub const IMG_FORMATS: [&str; 10] = [
    "bmp", "dng", "jpeg", "jpg", "mpo", "png", "tif", "tiff", "webp", "pfm",
];

/// Supplies frames one at a time in capture order.
pub trait FrameSource {
    /// `None` once the source is exhausted. An `Err` item is a frame that
    /// could not be read; later frames may still succeed.
    fn next_frame(&mut self) -> Option<Result<(Frame, FrameMeta)>>;
}

/// A single image file or every image in a directory, sorted by path.
#[derive(Debug)]
pub struct ImageSource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let paths = if path.is_dir() {
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(path)
                .with_context(|| format!("Failed to list {}", path.display()))?
            {
                let entry_path = entry?.path();
                if entry_path.is_file() && is_image(&entry_path) {
                    paths.push(entry_path);
                }
            }
            paths.sort();
            paths
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            anyhow::bail!("Source {} does not exist", path.display());
        };

        if paths.is_empty() {
            anyhow::bail!(
                "No images found in {} (supported: {})",
                path.display(),
                IMG_FORMATS.join(", ")
            );
        }

        tracing::info!(source = %path.display(), images = paths.len(), "Image source opened");
        Ok(Self { paths, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSource {
    fn next_frame(&mut self) -> Option<Result<(Frame, FrameMeta)>> {
        let path = self.paths.get(self.next)?;
        let frame_id = self.next as u64;
        self.next += 1;

        Some(load_image(path).map(|frame| {
            let meta = FrameMeta {
                frame_id,
                source: path.display().to_string(),
                timestamp_ns: now_ns(),
                width: frame.width(),
                height: frame.height(),
            };
            (frame, meta)
        }))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMG_FORMATS.contains(&e.to_lowercase().as_str()))
}

fn load_image(path: &Path) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("Failed to decode {}", path.display()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Ok(Frame::new(image.into_raw(), width, height, PixelFormat::Rgb))
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
