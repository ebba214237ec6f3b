//! Texture resource: 2D and cubemap GPU textures with an explicit mip chain
//!
//! A [`Texture`] owns its GPU storage plus every view and sampler derived from it, so a
//! single [`Texture::destroy`] releases everything. Cubemaps are six-layer 2D textures;
//! faces map to layers in [`CubeFace`] order.

use std::collections::HashMap;
use std::fmt;

use crate::backend::*;

use super::error::{ResourceError, ResourceResult};
use super::mipmap::Mipmapper;

/// Cube face, in the layer order of the GPU cube convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeFace {
    PositiveX,
    NegativeX,
    PositiveY,
    NegativeY,
    PositiveZ,
    NegativeZ,
}

impl CubeFace {
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PositiveX,
        CubeFace::NegativeX,
        CubeFace::PositiveY,
        CubeFace::NegativeY,
        CubeFace::PositiveZ,
        CubeFace::NegativeZ,
    ];

    /// Array layer holding this face
    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

impl fmt::Display for CubeFace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CubeFace::PositiveX => "+X",
            CubeFace::NegativeX => "-X",
            CubeFace::PositiveY => "+Y",
            CubeFace::NegativeY => "-Y",
            CubeFace::PositiveZ => "+Z",
            CubeFace::NegativeZ => "-Z",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    D2,
    Cube,
}

impl TextureKind {
    pub fn layer_count(self) -> u32 {
        match self {
            TextureKind::D2 => 1,
            TextureKind::Cube => 6,
        }
    }

    fn sample_dimension(self) -> TextureViewDimension {
        match self {
            TextureKind::D2 => TextureViewDimension::D2,
            TextureKind::Cube => TextureViewDimension::Cube,
        }
    }
}

/// Filtering and wrapping used when the texture is sampled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    /// `None` samples mip 0 only
    pub mipmap_filter: Option<FilterMode>,
    pub wrap_u: AddressMode,
    pub wrap_v: AddressMode,
    pub wrap_w: AddressMode,
}

impl SamplingParams {
    /// Bilinear within mip 0, clamped on every axis
    pub fn linear_clamp() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            mipmap_filter: None,
            wrap_u: AddressMode::ClampToEdge,
            wrap_v: AddressMode::ClampToEdge,
            wrap_w: AddressMode::ClampToEdge,
        }
    }

    /// Linear within and across mips, clamped on every axis
    pub fn trilinear_clamp() -> Self {
        Self {
            mipmap_filter: Some(FilterMode::Linear),
            ..Self::linear_clamp()
        }
    }

    /// Equirectangular panorama: longitude wraps, latitude clamps at the poles
    pub fn panorama() -> Self {
        Self {
            wrap_u: AddressMode::Repeat,
            ..Self::linear_clamp()
        }
    }

    fn descriptor(&self, label: &str) -> SamplerDescriptor {
        SamplerDescriptor {
            label: Some(format!("{label} sampler")),
            address_mode_u: self.wrap_u,
            address_mode_v: self.wrap_v,
            address_mode_w: self.wrap_w,
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
            mipmap_filter: self.mipmap_filter.unwrap_or(FilterMode::Nearest),
            lod_min_clamp: 0.0,
            lod_max_clamp: if self.mipmap_filter.is_some() { 32.0 } else { 0.0 },
        }
    }
}

/// Everything needed to allocate a texture
#[derive(Debug, Clone)]
pub struct TextureSpec {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub kind: TextureKind,
    pub format: TextureFormat,
    pub mip_levels: u32,
    pub usage: TextureUsage,
    pub sampling: SamplingParams,
}

impl TextureSpec {
    /// Cubemap that can be rendered to, written from compute, copied and sampled
    pub fn cube(label: impl Into<String>, face_size: u32, format: TextureFormat, mip_levels: u32) -> Self {
        let mut usage = TextureUsage::TEXTURE_BINDING
            | TextureUsage::RENDER_ATTACHMENT
            | TextureUsage::COPY_SRC
            | TextureUsage::COPY_DST;
        if format.supports_storage() {
            usage = usage | TextureUsage::STORAGE_BINDING;
        }
        Self {
            label: label.into(),
            width: face_size,
            height: face_size,
            kind: TextureKind::Cube,
            format,
            mip_levels,
            usage,
            sampling: SamplingParams::linear_clamp(),
        }
    }

    /// Single-mip 2D texture that can be uploaded to, rendered to and sampled
    pub fn d2(label: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            kind: TextureKind::D2,
            format,
            mip_levels: 1,
            usage: TextureUsage::TEXTURE_BINDING
                | TextureUsage::RENDER_ATTACHMENT
                | TextureUsage::COPY_SRC
                | TextureUsage::COPY_DST,
            sampling: SamplingParams::linear_clamp(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// `floor(log2(max(width, height))) + 1`
pub fn max_mip_levels(width: u32, height: u32) -> u32 {
    let largest = width.max(height);
    if largest == 0 {
        0
    } else {
        u32::BITS - largest.leading_zeros()
    }
}

/// Extent of `size` at `mip`, never below one texel
pub fn mip_extent(size: u32, mip: u32) -> u32 {
    size.checked_shr(mip).unwrap_or(0).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ViewKey {
    Layer { layer: u32, mip: u32 },
    Layers { mip: u32 },
}

struct GpuTexture {
    handle: TextureHandle,
    sample_view: Option<TextureViewHandle>,
    sampler: Option<SamplerHandle>,
    views: HashMap<ViewKey, TextureViewHandle>,
}

impl GpuTexture {
    fn release(self, backend: &mut dyn GraphicsBackend) {
        for view in self.views.into_values() {
            backend.destroy_texture_view(view);
        }
        if let Some(view) = self.sample_view {
            backend.destroy_texture_view(view);
        }
        if let Some(sampler) = self.sampler {
            backend.destroy_sampler(sampler);
        }
        backend.destroy_texture(self.handle);
    }
}

/// One GPU texture and its allocation/parameter state
pub struct Texture {
    spec: TextureSpec,
    gpu: Option<GpuTexture>,
    // Bit per layer whose mip 0 has been written since allocation
    base_level_written: u8,
}

impl Texture {
    /// Validate `spec` without touching the GPU.
    ///
    /// # Panics
    /// On a zero extent, or a cube with non-square faces.
    pub fn new(spec: TextureSpec) -> ResourceResult<Self> {
        assert!(
            spec.width > 0 && spec.height > 0,
            "texture '{}' has a zero extent ({}x{})",
            spec.label,
            spec.width,
            spec.height
        );
        if spec.kind == TextureKind::Cube {
            assert_eq!(spec.width, spec.height, "cube texture '{}' needs square faces", spec.label);
        }

        let max = max_mip_levels(spec.width, spec.height);
        if spec.mip_levels == 0 || spec.mip_levels > max {
            return Err(ResourceError::InvalidMipCount {
                label: spec.label,
                requested: spec.mip_levels,
                max,
            });
        }

        Ok(Self {
            spec,
            gpu: None,
            base_level_written: 0,
        })
    }

    /// Validate and allocate in one step
    pub fn create(backend: &mut dyn GraphicsBackend, spec: TextureSpec) -> ResourceResult<Self> {
        let mut texture = Self::new(spec)?;
        texture.allocate(backend)?;
        Ok(texture)
    }

    /// Reserve storage for every mip level up front
    pub fn allocate(&mut self, backend: &mut dyn GraphicsBackend) -> ResourceResult<()> {
        if self.gpu.is_some() {
            return Err(ResourceError::AlreadyAllocated(self.spec.label.clone()));
        }

        let handle = backend.create_texture(&TextureDescriptor {
            label: Some(self.spec.label.clone()),
            width: self.spec.width,
            height: self.spec.height,
            array_layers: self.spec.kind.layer_count(),
            mip_levels: self.spec.mip_levels,
            format: self.spec.format,
            usage: self.spec.usage,
        })?;

        let mut gpu = GpuTexture {
            handle,
            sample_view: None,
            sampler: None,
            views: HashMap::new(),
        };
        if let Err(err) = self.create_sampling_state(backend, &mut gpu) {
            gpu.release(backend);
            return Err(err);
        }

        self.gpu = Some(gpu);
        self.base_level_written = 0;
        Ok(())
    }

    fn create_sampling_state(
        &self,
        backend: &mut dyn GraphicsBackend,
        gpu: &mut GpuTexture,
    ) -> ResourceResult<()> {
        if !self.spec.usage.contains(TextureUsage::TEXTURE_BINDING) {
            return Ok(());
        }
        gpu.sample_view = Some(backend.create_texture_view(
            gpu.handle,
            &TextureViewDescriptor {
                label: Some(format!("{} sampled", self.spec.label)),
                dimension: self.spec.kind.sample_dimension(),
                base_mip_level: 0,
                mip_level_count: self.spec.mip_levels,
                base_array_layer: 0,
                array_layer_count: self.spec.kind.layer_count(),
            },
        )?);
        gpu.sampler = Some(backend.create_sampler(&self.spec.sampling.descriptor(&self.spec.label))?);
        Ok(())
    }

    fn gpu(&self) -> ResourceResult<&GpuTexture> {
        self.gpu
            .as_ref()
            .ok_or_else(|| ResourceError::NotAllocated(self.spec.label.clone()))
    }

    pub(crate) fn layer_for(&self, face: Option<CubeFace>) -> ResourceResult<u32> {
        match (self.spec.kind, face) {
            (TextureKind::D2, None) => Ok(0),
            (TextureKind::Cube, Some(face)) => Ok(face.index()),
            (kind, face) => Err(ResourceError::FaceMismatch {
                label: self.spec.label.clone(),
                kind,
                face,
            }),
        }
    }

    pub(crate) fn check_mip(&self, mip: u32) -> ResourceResult<()> {
        if mip >= self.spec.mip_levels {
            return Err(ResourceError::MipOutOfRange {
                label: self.spec.label.clone(),
                mip,
                levels: self.spec.mip_levels,
            });
        }
        Ok(())
    }

    /// Record that `layer` of `mip` now holds data
    pub(crate) fn note_written(&mut self, layer: u32, mip: u32) {
        if mip == 0 {
            self.base_level_written |= 1 << layer;
        }
    }

    /// Whether every layer of mip 0 has been written since allocation
    pub fn is_base_level_complete(&self) -> bool {
        self.base_level_written.count_ones() == self.spec.kind.layer_count()
    }

    /// Upload tightly packed texels for one face (or the single 2D layer) of one mip
    pub fn write_face(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        face: Option<CubeFace>,
        mip: u32,
        pixels: &[u8],
    ) -> ResourceResult<()> {
        let layer = self.layer_for(face)?;
        self.check_mip(mip)?;
        let (width, height) = self.mip_size(mip);
        let expected = (width * height * self.spec.format.bytes_per_pixel()) as usize;
        if pixels.len() != expected {
            return Err(ResourceError::DataSizeMismatch {
                label: self.spec.label.clone(),
                expected,
                actual: pixels.len(),
            });
        }

        let handle = self.gpu()?.handle;
        backend.write_texture(
            TextureCopyLocation {
                texture: handle,
                mip_level: mip,
                base_array_layer: layer,
            },
            pixels,
            width,
            height,
        )?;
        self.note_written(layer, mip);
        Ok(())
    }

    /// Derive mips 1.. from mip 0 on the GPU
    pub fn generate_mipmaps(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        mipmapper: &mut Mipmapper,
    ) -> ResourceResult<()> {
        if !self.is_base_level_complete() {
            return Err(ResourceError::BaseLevelIncomplete(self.spec.label.clone()));
        }
        mipmapper.generate(backend, self)
    }

    /// Copy every layer of `source_mip` of `source` into `target_mip` of this texture
    pub fn copy_from(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        source: &Texture,
        source_mip: u32,
        target_mip: u32,
    ) -> ResourceResult<()> {
        source.check_mip(source_mip)?;
        self.check_mip(target_mip)?;
        let mismatch = |reason: String| ResourceError::CopyMismatch {
            source_label: source.label().to_string(),
            source_mip,
            target_label: self.label().to_string(),
            target_mip,
            reason,
        };

        if source.format() != self.format() {
            return Err(mismatch(format!("{:?} vs {:?}", source.format(), self.format())));
        }
        if source.kind() != self.kind() {
            return Err(mismatch(format!("{:?} vs {:?}", source.kind(), self.kind())));
        }
        let extent = source.mip_size(source_mip);
        if extent != self.mip_size(target_mip) {
            return Err(mismatch(format!(
                "{:?} vs {:?}",
                extent,
                self.mip_size(target_mip)
            )));
        }

        let layers = self.spec.kind.layer_count();
        backend.copy_texture_to_texture(
            TextureCopyLocation {
                texture: source.handle()?,
                mip_level: source_mip,
                base_array_layer: 0,
            },
            TextureCopyLocation {
                texture: self.handle()?,
                mip_level: target_mip,
                base_array_layer: 0,
            },
            Extent3d {
                width: extent.0,
                height: extent.1,
                layers,
            },
        )?;
        for layer in 0..layers {
            self.note_written(layer, target_mip);
        }
        Ok(())
    }

    /// Replace the filter/wrap state; takes effect for bindings made afterwards
    pub fn set_sampling(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        sampling: SamplingParams,
    ) -> ResourceResult<()> {
        self.spec.sampling = sampling;
        let descriptor = sampling.descriptor(&self.spec.label);
        let Some(gpu) = self.gpu.as_mut() else {
            return Ok(());
        };
        if let Some(old) = gpu.sampler.take() {
            backend.destroy_sampler(old);
            gpu.sampler = Some(backend.create_sampler(&descriptor)?);
        }
        Ok(())
    }

    /// Single-mip view of one face (or the 2D layer), for attachment or per-face sampling
    pub fn layer_view(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        face: Option<CubeFace>,
        mip: u32,
    ) -> ResourceResult<TextureViewHandle> {
        let layer = self.layer_for(face)?;
        self.check_mip(mip)?;
        self.cached_view(
            backend,
            ViewKey::Layer { layer, mip },
            TextureViewDescriptor {
                label: Some(format!("{} layer {layer} mip {mip}", self.spec.label)),
                dimension: TextureViewDimension::D2,
                base_mip_level: mip,
                mip_level_count: 1,
                base_array_layer: layer,
                array_layer_count: 1,
            },
        )
    }

    /// Array view of every layer of one mip, for layered storage writes
    pub fn layered_view(&mut self, backend: &mut dyn GraphicsBackend, mip: u32) -> ResourceResult<TextureViewHandle> {
        self.check_mip(mip)?;
        self.cached_view(
            backend,
            ViewKey::Layers { mip },
            TextureViewDescriptor {
                label: Some(format!("{} layers mip {mip}", self.spec.label)),
                dimension: TextureViewDimension::D2Array,
                base_mip_level: mip,
                mip_level_count: 1,
                base_array_layer: 0,
                array_layer_count: self.spec.kind.layer_count(),
            },
        )
    }

    fn cached_view(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        key: ViewKey,
        descriptor: TextureViewDescriptor,
    ) -> ResourceResult<TextureViewHandle> {
        let label = self.spec.label.clone();
        let gpu = self.gpu.as_mut().ok_or(ResourceError::NotAllocated(label))?;
        if let Some(view) = gpu.views.get(&key) {
            return Ok(*view);
        }
        let view = backend.create_texture_view(gpu.handle, &descriptor)?;
        gpu.views.insert(key, view);
        Ok(view)
    }

    /// View over all mips and layers, as a shader samples it
    pub fn sample_view(&self) -> ResourceResult<TextureViewHandle> {
        self.gpu()?
            .sample_view
            .ok_or_else(|| ResourceError::NotSampleable(self.spec.label.clone()))
    }

    pub fn sampler(&self) -> ResourceResult<SamplerHandle> {
        self.gpu()?
            .sampler
            .ok_or_else(|| ResourceError::NotSampleable(self.spec.label.clone()))
    }

    pub fn handle(&self) -> ResourceResult<TextureHandle> {
        Ok(self.gpu()?.handle)
    }

    /// Read one face/mip back as RGBA floats, row-major from the top row.
    /// Two-channel formats fill blue with 0 and alpha with 1.
    pub fn read_texels(
        &self,
        backend: &mut dyn GraphicsBackend,
        face: Option<CubeFace>,
        mip: u32,
    ) -> ResourceResult<Vec<[f32; 4]>> {
        let layer = self.layer_for(face)?;
        self.check_mip(mip)?;
        let (width, height) = self.mip_size(mip);
        let bytes = backend.read_texture(
            TextureCopyLocation {
                texture: self.handle()?,
                mip_level: mip,
                base_array_layer: layer,
            },
            width,
            height,
        )?;
        Ok(decode_texels(self.spec.format, &bytes))
    }

    /// Release the GPU storage and every derived view. Safe to call repeatedly.
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(gpu) = self.gpu.take() {
            log::debug!("Destroying texture '{}'", self.spec.label);
            gpu.release(backend);
        }
        self.base_level_written = 0;
    }

    pub fn is_allocated(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn width(&self) -> u32 {
        self.spec.width
    }

    pub fn height(&self) -> u32 {
        self.spec.height
    }

    pub fn kind(&self) -> TextureKind {
        self.spec.kind
    }

    pub fn format(&self) -> TextureFormat {
        self.spec.format
    }

    pub fn mip_levels(&self) -> u32 {
        self.spec.mip_levels
    }

    pub fn sampling(&self) -> SamplingParams {
        self.spec.sampling
    }

    /// Width and height of one face at `mip`
    pub fn mip_size(&self, mip: u32) -> (u32, u32) {
        (mip_extent(self.spec.width, mip), mip_extent(self.spec.height, mip))
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if self.gpu.is_some() {
            log::warn!(
                "Texture '{}' dropped without destroy(); its GPU storage lives until the backend goes away",
                self.spec.label
            );
        }
    }
}

fn decode_texels(format: TextureFormat, bytes: &[u8]) -> Vec<[f32; 4]> {
    let half = |b: &[u8]| half::f16::from_le_bytes([b[0], b[1]]).to_f32();
    let single = |b: &[u8]| f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    let stride = format.bytes_per_pixel() as usize;

    bytes
        .chunks_exact(stride)
        .map(|t| match format {
            TextureFormat::Rgba8Unorm => [
                t[0] as f32 / 255.0,
                t[1] as f32 / 255.0,
                t[2] as f32 / 255.0,
                t[3] as f32 / 255.0,
            ],
            TextureFormat::Rgba16Float => [half(&t[0..]), half(&t[2..]), half(&t[4..]), half(&t[6..])],
            TextureFormat::Rgba32Float => [single(&t[0..]), single(&t[4..]), single(&t[8..]), single(&t[12..])],
            TextureFormat::Rg16Float => [half(&t[0..]), half(&t[2..]), 0.0, 1.0],
            TextureFormat::Rg32Float => [single(&t[0..]), single(&t[4..]), 0.0, 1.0],
            TextureFormat::Depth32Float => [single(t), 0.0, 0.0, 1.0],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    fn cube_spec(size: u32, mips: u32) -> TextureSpec {
        TextureSpec::cube("test cube", size, TextureFormat::Rgba16Float, mips)
    }

    #[test]
    fn test_max_mip_levels() {
        assert_eq!(max_mip_levels(1, 1), 1);
        assert_eq!(max_mip_levels(2, 2), 2);
        assert_eq!(max_mip_levels(512, 512), 10);
        assert_eq!(max_mip_levels(513, 1), 10);
        assert_eq!(max_mip_levels(1024, 512), 11);
        assert_eq!(max_mip_levels(0, 0), 0);
    }

    #[test]
    fn test_mip_extent_halves_and_floors_at_one() {
        assert_eq!(mip_extent(256, 0), 256);
        assert_eq!(mip_extent(256, 3), 32);
        assert_eq!(mip_extent(256, 8), 1);
        assert_eq!(mip_extent(256, 12), 1);
        assert_eq!(mip_extent(256, 40), 1);
    }

    #[test]
    fn test_mip_count_bound_is_enforced() {
        for size in [1u32, 3, 16, 100, 128, 512] {
            let bound = (size as f32).log2().floor() as u32 + 1;
            assert!(Texture::new(cube_spec(size, bound)).is_ok(), "size {size}");
            assert!(
                matches!(
                    Texture::new(cube_spec(size, bound + 1)),
                    Err(ResourceError::InvalidMipCount { max, .. }) if max == bound
                ),
                "size {size}"
            );
        }
        assert!(Texture::new(cube_spec(64, 0)).is_err());
    }

    #[test]
    #[should_panic(expected = "zero extent")]
    fn test_zero_extent_is_fatal() {
        let _ = Texture::new(TextureSpec::d2("empty", 0, 4, TextureFormat::Rgba8Unorm));
    }

    #[test]
    #[should_panic(expected = "square faces")]
    fn test_non_square_cube_is_fatal() {
        let mut spec = cube_spec(8, 1);
        spec.height = 4;
        let _ = Texture::new(spec);
    }

    #[test]
    fn test_reallocation_requires_destroy() {
        let mut backend = DummyBackend::new();
        let mut texture = Texture::create(&mut backend, cube_spec(32, 6)).unwrap();

        assert!(matches!(
            texture.allocate(&mut backend),
            Err(ResourceError::AlreadyAllocated(_))
        ));

        texture.destroy(&mut backend);
        texture.destroy(&mut backend);
        assert_eq!(backend.live_textures(), 0);
        assert!(texture.allocate(&mut backend).is_ok());
        texture.destroy(&mut backend);
    }

    #[test]
    fn test_destroy_releases_views_and_sampler() {
        let mut backend = DummyBackend::new();
        let mut texture = Texture::create(&mut backend, cube_spec(32, 6)).unwrap();
        for face in CubeFace::ALL {
            texture.layer_view(&mut backend, Some(face), 2).unwrap();
        }
        texture.layered_view(&mut backend, 1).unwrap();
        assert_eq!(backend.live_texture_views(), 1 + 6 + 1);

        texture.destroy(&mut backend);
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_texture_views(), 0);
        assert_eq!(backend.live_samplers(), 0);
    }

    #[test]
    fn test_views_are_cached_per_layer_and_mip() {
        let mut backend = DummyBackend::new();
        let mut texture = Texture::create(&mut backend, cube_spec(16, 3)).unwrap();

        let a = texture.layer_view(&mut backend, Some(CubeFace::NegativeY), 1).unwrap();
        let b = texture.layer_view(&mut backend, Some(CubeFace::NegativeY), 1).unwrap();
        let c = texture.layer_view(&mut backend, Some(CubeFace::NegativeY), 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let (_, desc) = backend.view_descriptor(c).unwrap();
        assert_eq!(desc.base_array_layer, 3);
        assert_eq!(desc.base_mip_level, 2);
        assert_eq!(desc.dimension, TextureViewDimension::D2);

        texture.destroy(&mut backend);
    }

    #[test]
    fn test_unallocated_texture_is_a_usage_error() {
        let mut backend = DummyBackend::new();
        let mut texture = Texture::new(cube_spec(16, 1)).unwrap();

        assert!(matches!(texture.sample_view(), Err(ResourceError::NotAllocated(_))));
        assert!(matches!(
            texture.layer_view(&mut backend, Some(CubeFace::PositiveX), 0),
            Err(ResourceError::NotAllocated(_))
        ));
    }

    #[test]
    fn test_write_face_checks_addressing_and_size() {
        let mut backend = DummyBackend::new();
        let mut cube = Texture::create(&mut backend, cube_spec(4, 3)).unwrap();
        let mip1 = vec![0u8; 2 * 2 * 8];

        assert!(cube.write_face(&mut backend, Some(CubeFace::PositiveZ), 1, &mip1).is_ok());
        assert!(matches!(
            cube.write_face(&mut backend, None, 1, &mip1),
            Err(ResourceError::FaceMismatch { .. })
        ));
        assert!(matches!(
            cube.write_face(&mut backend, Some(CubeFace::PositiveZ), 3, &mip1),
            Err(ResourceError::MipOutOfRange { .. })
        ));
        assert!(matches!(
            cube.write_face(&mut backend, Some(CubeFace::PositiveZ), 0, &mip1),
            Err(ResourceError::DataSizeMismatch { expected: 128, .. })
        ));

        cube.destroy(&mut backend);
    }

    #[test]
    fn test_base_level_tracking() {
        let mut backend = DummyBackend::new();
        let mut cube = Texture::create(&mut backend, cube_spec(2, 2)).unwrap();
        let texels = vec![0u8; 2 * 2 * 8];

        for face in &CubeFace::ALL[..5] {
            cube.write_face(&mut backend, Some(*face), 0, &texels).unwrap();
        }
        assert!(!cube.is_base_level_complete());
        cube.write_face(&mut backend, Some(CubeFace::NegativeZ), 0, &texels).unwrap();
        assert!(cube.is_base_level_complete());

        cube.destroy(&mut backend);
        assert!(!cube.is_base_level_complete());
    }

    #[test]
    fn test_copy_requires_matching_extent_and_format() {
        let mut backend = DummyBackend::new();
        let env = Texture::create(&mut backend, cube_spec(64, 7)).unwrap();
        let mut prefilter = Texture::create(&mut backend, cube_spec(32, 5)).unwrap();

        assert!(matches!(
            prefilter.copy_from(&mut backend, &env, 0, 0),
            Err(ResourceError::CopyMismatch { .. })
        ));
        prefilter.copy_from(&mut backend, &env, 1, 0).unwrap();
        assert!(prefilter.is_base_level_complete());

        let mut half_float = Texture::create(
            &mut backend,
            TextureSpec::cube("rgba32", 32, TextureFormat::Rgba32Float, 1),
        )
        .unwrap();
        assert!(half_float.copy_from(&mut backend, &env, 1, 0).is_err());

        let mut env = env;
        for texture in [&mut env, &mut prefilter, &mut half_float] {
            texture.destroy(&mut backend);
        }
    }

    #[test]
    fn test_set_sampling_replaces_sampler() {
        let mut backend = DummyBackend::new();
        let mut texture = Texture::create(&mut backend, cube_spec(8, 4)).unwrap();
        let before = texture.sampler().unwrap();

        texture
            .set_sampling(&mut backend, SamplingParams::trilinear_clamp())
            .unwrap();
        let after = texture.sampler().unwrap();
        assert_ne!(before, after);
        assert_eq!(backend.live_samplers(), 1);

        let desc = backend.sampler_descriptor(after).unwrap();
        assert_eq!(desc.mipmap_filter, FilterMode::Linear);
        assert!(desc.lod_max_clamp > 0.0);

        texture.destroy(&mut backend);
    }

    #[test]
    fn test_decode_half_float_texels() {
        let bytes: Vec<u8> = [0.5f32, 1.0, 2.0, 1.0]
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        assert_eq!(decode_texels(TextureFormat::Rgba16Float, &bytes), vec![[0.5, 1.0, 2.0, 1.0]]);

        let rg: Vec<u8> = [0.25f32, 0.75]
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        assert_eq!(decode_texels(TextureFormat::Rg16Float, &rg), vec![[0.25, 0.75, 0.0, 1.0]]);
    }
}
