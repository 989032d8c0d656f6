//! PNG export of a rendered canvas.

use crate::types::OutputCanvas;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to write {path}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no image loaded; nothing to export")]
    NoImage,
}

/// Write `canvas` as an 8-bit RGB PNG.
///
/// The file is written to a temporary sibling and renamed into place, so a
/// failed export never leaves a truncated file at `path`. Missing parent
/// directories are created.
pub fn export_png(canvas: &OutputCanvas, path: &Path) -> Result<(), ExportError> {
    let io_failure = |source: std::io::Error| ExportError::IoFailure {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_failure)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_failure)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        PngEncoder::new(&mut writer)
            .write_image(
                canvas.image.as_raw(),
                canvas.width(),
                canvas.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| io_failure(std::io::Error::other(e)))?;
        writer.flush().map_err(io_failure)?;
    }
    tmp.persist(path).map_err(|e| io_failure(e.error))?;

    tracing::info!(
        path = %path.display(),
        width = canvas.width(),
        height = canvas.height(),
        "exported passport photo"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn canvas() -> OutputCanvas {
        OutputCanvas {
            image: RgbImage::from_pixel(9, 12, Rgb([10, 20, 30])),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_export_creates_parent_dirs_and_writes_rgb_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/photo.png");
        export_png(&canvas(), &path).unwrap();

        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.color(), image::ColorType::Rgb8);
        let rgb = decoded.into_rgb8();
        assert_eq!(rgb.dimensions(), (9, 12));
        assert_eq!(*rgb.get_pixel(4, 4), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_export_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        std::fs::write(&path, b"old").unwrap();
        export_png(&canvas(), &path).unwrap();
        assert!(image::open(&path).is_ok());
        // No temporary files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_export_into_unwritable_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let result = export_png(&canvas(), &blocker.join("photo.png"));
        assert!(matches!(result, Err(ExportError::IoFailure { .. })));
    }
}
