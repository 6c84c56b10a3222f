use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, ImageError};
use thiserror::Error;
use tracing::debug;

pub const RESULT_FILE_NAME: &str = "result.jpg";
const JPEG_QUALITY: u8 = 75;

/// Single-slot store for the latest edit result.
#[derive(Debug)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn result_path(&self) -> PathBuf {
        self.dir.join(RESULT_FILE_NAME)
    }

    /// Creates the result directory if it does not exist yet.
    pub fn prepare(&self) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Overwrites the result file with `image` encoded as JPEG.
    ///
    /// The image is written to a uniquely named temporary sibling first and
    /// renamed over the result, so readers never observe a partially written
    /// file. The temporary file is removed if any step fails.
    pub fn save(&self, image: &DynamicImage) -> Result<PathBuf, PersistError> {
        let target = self.result_path();
        let mut staging = tempfile::Builder::new()
            .prefix(".result")
            .suffix(".jpg.tmp")
            .tempfile_in(&self.dir)?;

        let mut writer = BufWriter::new(staging.as_file_mut());
        encode_jpeg(image, &mut writer)?;
        writer.flush()?;
        drop(writer);
        staging.persist(&target).map_err(|err| err.error)?;

        debug!(path = %target.display(), "result saved");
        Ok(target)
    }
}

/// Encodes `image` as an RGB JPEG, dropping any alpha channel.
pub fn encode_jpeg(image: &DynamicImage, writer: impl Write) -> Result<(), PersistError> {
    let rgb = image.to_rgb8();
    JpegEncoder::new_with_quality(writer, JPEG_QUALITY).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ColorType::Rgb8,
    )?;
    Ok(())
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistError {
    #[error("failed to encode the result image: {0}")]
    Encode(#[from] ImageError),
    #[error("I/O error when saving the result: {0}")]
    Io(#[from] io::Error),
}
