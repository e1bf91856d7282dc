use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::PersistError;

/// A short token naming one batch's files. The first 8 hex digits of a v4 UUID.
pub fn new_batch_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Append-only directory of generated images and batch archives.
#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn image_path(&self, batch_id: &str, index: usize) -> PathBuf {
        self.dir.join(format!("gen_{batch_id}_{index}.png"))
    }

    pub fn archive_path(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("batch_{batch_id}.zip"))
    }

    fn ensure_dir(&self) -> Result<(), PersistError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| PersistError::Directory {
            path: self.dir.clone(),
            source,
        })
    }

    /// Writes `image` as PNG under the batch/index name.
    pub fn save_image(
        &self,
        batch_id: &str,
        index: usize,
        image: &DynamicImage,
    ) -> Result<PathBuf, PersistError> {
        self.ensure_dir()?;
        let path = self.image_path(batch_id, index);
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|source| PersistError::Image {
                path: path.clone(),
                source,
            })?;
        debug!("Saved {}", path.display());
        Ok(path)
    }

    /// Bundles `files` into `batch_<batch_id>.zip`, each under its base name.
    /// A partially written archive is removed again on failure.
    pub fn write_archive(&self, batch_id: &str, files: &[PathBuf]) -> Result<PathBuf, PersistError> {
        self.ensure_dir()?;
        let path = self.archive_path(batch_id);
        if let Err(e) = write_zip(&path, files) {
            if let Err(cleanup) = std::fs::remove_file(&path) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!("Could not remove partial archive {}: {cleanup}", path.display());
                }
            }
            return Err(e);
        }

        info!("Archived {} file(s) into {}", files.len(), path.display());
        Ok(path)
    }
}

fn write_zip(path: &Path, files: &[PathBuf]) -> Result<(), PersistError> {
    let io_err = |source: io::Error| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };
    let zip_err = |source: zip::result::ZipError| PersistError::Zip {
        path: path.to_path_buf(),
        source,
    };

    let mut zip = ZipWriter::new(File::create(path).map_err(io_err)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io_err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no file name", file.display()),
                ))
            })?;
        zip.start_file(name, options).map_err(zip_err)?;
        let mut source = File::open(file).map_err(io_err)?;
        io::copy(&mut source, &mut zip).map_err(io_err)?;
    }
    zip.finish().map_err(zip_err)?;
    Ok(())
}
