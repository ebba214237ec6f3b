//! HDR panorama loading and upload

use std::path::Path;

use image::{DynamicImage, GenericImageView};

use crate::backend::*;

use super::error::{ResourceError, ResourceResult};
use super::texture::{SamplingParams, Texture, TextureSpec};

/// Linear RGBA float image, rows top-down
#[derive(Debug, Clone)]
pub struct HdrImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[f32; 4]>,
    pub name: String,
}

impl HdrImage {
    /// Load an image file (Radiance `.hdr`, or any LDR format the `image` crate reads)
    pub fn from_file<P: AsRef<Path>>(path: P) -> ResourceResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("panorama")
            .to_string();

        let img = image::open(path).map_err(|e| ResourceError::ImageLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::from_image(img, &name))
    }

    /// Decode an in-memory image file
    pub fn from_bytes(bytes: &[u8], name: &str) -> ResourceResult<Self> {
        let img = image::load_from_memory(bytes).map_err(|e| ResourceError::ImageLoad {
            path: name.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        let pixels = img
            .into_rgba32f()
            .pixels()
            .map(|p| p.0)
            .collect();

        Self {
            width,
            height,
            pixels,
            name: name.to_string(),
        }
    }

    /// # Panics
    /// If `pixels` does not hold exactly `width * height` texels.
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<[f32; 4]>, name: &str) -> Self {
        assert_eq!(
            pixels.len(),
            (width * height) as usize,
            "image '{name}' is {width}x{height} but has {} pixels",
            pixels.len()
        );
        Self {
            width,
            height,
            pixels,
            name: name.to_string(),
        }
    }

    /// Same radiance in every direction
    pub fn uniform(width: u32, height: u32, color: [f32; 3], name: &str) -> Self {
        let texel = [color[0], color[1], color[2], 1.0];
        Self::from_pixels(width, height, vec![texel; (width * height) as usize], name)
    }

    /// Fill from `f(u, v)` evaluated at texel centers
    pub fn from_fn(width: u32, height: u32, name: &str, f: impl Fn(f32, f32) -> [f32; 3]) -> Self {
        let mut pixels = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let u = (x as f32 + 0.5) / width as f32;
                let v = (y as f32 + 0.5) / height as f32;
                let [r, g, b] = f(u, v);
                pixels.push([r, g, b, 1.0]);
            }
        }
        Self::from_pixels(width, height, pixels, name)
    }

    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.pixels[(y * self.width + x) as usize]
    }

    pub fn to_rgba16f_bytes(&self) -> Vec<u8> {
        let halves: Vec<half::f16> = self
            .pixels
            .iter()
            .flatten()
            .map(|v| half::f16::from_f32(*v))
            .collect();
        bytemuck::cast_slice(&halves).to_vec()
    }

    /// Upload as a sampled 2D texture: longitude wraps, latitude clamps
    pub fn upload(&self, backend: &mut dyn GraphicsBackend) -> ResourceResult<Texture> {
        let spec = TextureSpec::d2(&self.name, self.width, self.height, TextureFormat::Rgba16Float)
            .with_usage(TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST)
            .with_sampling(SamplingParams::panorama());
        let mut texture = Texture::create(backend, spec)?;
        if let Err(err) = texture.write_face(backend, None, 0, &self.to_rgba16f_bytes()) {
            texture.destroy(backend);
            return Err(err);
        }
        Ok(texture)
    }
}
