//! HDR/EXR environment map loading.

use std::path::Path;

use crate::util::{Error, Result};

/// Equirectangular environment image, RGBA f32, top row first.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentImage {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<f32>,
}

impl EnvironmentImage {
    /// Built-in two-row sky: bright zenith over a dim horizon band.
    pub fn default_sky() -> Self {
        Self {
            width: 2,
            height: 2,
            texels: vec![
                1.2, 1.4, 1.8, 1.0, 1.2, 1.4, 1.8, 1.0, //
                0.25, 0.22, 0.2, 1.0, 0.25, 0.22, 0.2, 1.0,
            ],
        }
    }

    /// Average radiance.
    pub fn mean_rgb(&self) -> [f32; 3] {
        let count = (self.texels.len() / 4).max(1) as f32;
        let mut sum = [0.0f32; 3];
        for px in self.texels.chunks_exact(4) {
            sum[0] += px[0];
            sum[1] += px[1];
            sum[2] += px[2];
        }
        sum.map(|s| s / count)
    }
}

/// Load a Radiance HDR or OpenEXR file.
pub fn load(path: &Path) -> Result<EnvironmentImage> {
    use image::{GenericImageView, ImageReader};

    let fail = |reason: String| Error::EnvironmentMap {
        path: path.to_path_buf(),
        reason,
    };

    let img = ImageReader::open(path)
        .map_err(|e| fail(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| fail(e.to_string()))?
        .decode()
        .map_err(|e| fail(e.to_string()))?;
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(fail("empty image".into()));
    }

    let env = EnvironmentImage {
        width,
        height,
        texels: img.to_rgba32f().into_raw(),
    };
    tracing::info!(path = %path.display(), width, height, mean = ?env.mean_rgb(), "loaded environment map");
    Ok(env)
}

/// Load `path` if given, otherwise fall back to the built-in sky.
pub fn load_or_default(path: Option<&Path>) -> Result<EnvironmentImage> {
    match path {
        Some(p) => load(p),
        None => Ok(EnvironmentImage::default_sky()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sky_shape() {
        let sky = EnvironmentImage::default_sky();
        assert_eq!(sky.texels.len(), (sky.width * sky.height * 4) as usize);
        let mean = sky.mean_rgb();
        assert!(mean.iter().all(|&c| c > 0.0));
    }

    #[test]
    fn test_missing_file() {
        let err = load(Path::new("does/not/exist.hdr")).unwrap_err();
        assert!(matches!(err, Error::EnvironmentMap { .. }));
    }

    #[test]
    fn test_load_hdr_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sky.hdr");
        let pixels: Vec<image::Rgb<f32>> = (0..8).map(|i| image::Rgb([i as f32, 0.5, 0.25])).collect();
        let file = std::fs::File::create(&path).unwrap();
        image::codecs::hdr::HdrEncoder::new(file).encode(&pixels, 4, 2).unwrap();

        let env = load(&path).unwrap();
        assert_eq!((env.width, env.height), (4, 2));
        assert_eq!(env.texels.len(), 4 * 2 * 4);
        assert!((env.texels[4] - 1.0).abs() < 0.05);
    }
}
