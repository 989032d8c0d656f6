//! Source image loading.

use image::{DynamicImage, ImageDecoder, ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cannot open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{path} is empty (0×0)")]
    Empty { path: PathBuf },
}

/// Decode an image file to 8-bit RGB with its EXIF orientation applied.
pub fn load_source(path: &Path) -> Result<RgbImage, SourceError> {
    let decode_err = |source: image::ImageError| SourceError::Decode {
        path: path.to_path_buf(),
        source,
    };

    let reader = ImageReader::open(path)
        .map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .with_guessed_format()
        .map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let mut decoder = reader.into_decoder().map_err(decode_err)?;
    let orientation = decoder.orientation().map_err(decode_err)?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(decode_err)?;
    image.apply_orientation(orientation);

    let rgb = image.into_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(SourceError::Empty {
            path: path.to_path_buf(),
        });
    }
    tracing::info!(
        path = %path.display(),
        width = rgb.width(),
        height = rgb.height(),
        ?orientation,
        "loaded source image"
    );
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_png_roundtrip_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portrait.png");
        RgbImage::from_pixel(30, 40, image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();
        let image = load_source(&path).unwrap();
        assert_eq!(image.dimensions(), (30, 40));
        assert_eq!(*image.get_pixel(0, 0), image::Rgb([1, 2, 3]));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = load_source(Path::new("/nonexistent/portrait.jpg"));
        assert!(matches!(result, Err(SourceError::Io { .. })));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.png");
        std::fs::write(&path, b"definitely not an image").unwrap();
        assert!(matches!(load_source(&path), Err(SourceError::Decode { .. })));
    }
}
