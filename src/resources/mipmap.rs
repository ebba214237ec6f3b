//! GPU mip chain generation.
//!
//! Each level is rendered from the one above it with a linear sampler, one pass per
//! layer, so cubemap faces are filtered independently.

use std::collections::HashMap;

use crate::backend::*;

use super::error::{ResourceError, ResourceResult};
use super::mesh::DrawPrimitive;
use super::render_target::RenderTarget;
use super::shader::ShaderProgram;
use super::shader_library::ShaderLibrary;
use super::texture::{CubeFace, Texture, TextureKind};

/// Downsampling programs for a fixed set of color formats
pub struct Mipmapper {
    formats: Vec<TextureFormat>,
    programs: HashMap<TextureFormat, ShaderProgram>,
    sampler: Option<SamplerHandle>,
    target: RenderTarget,
    triangle: DrawPrimitive,
}

impl Mipmapper {
    pub fn new(formats: impl IntoIterator<Item = TextureFormat>) -> Self {
        Self {
            formats: formats.into_iter().collect(),
            programs: HashMap::new(),
            sampler: None,
            target: RenderTarget::new("mipmap", None),
            triangle: DrawPrimitive::fullscreen_triangle(),
        }
    }

    fn program(format: TextureFormat) -> ShaderProgram {
        ShaderProgram::new(format!("mipmap {format:?}"))
            .with_stage(ShaderStage::Vertex, "fullscreen.vertex")
            .with_stage(ShaderStage::Fragment, "mipmap.fragment")
            .with_texture("source_level", 1, TextureViewDimension::D2)
            .with_color_target(format)
    }

    pub fn formats(&self) -> &[TextureFormat] {
        &self.formats
    }

    pub(crate) fn describe(formats: &[TextureFormat]) -> Vec<ShaderProgram> {
        formats.iter().map(|f| Self::program(*f)).collect()
    }

    /// Create the sampler and link one program per supported format
    pub fn link(&mut self, backend: &mut dyn GraphicsBackend, library: &ShaderLibrary) -> ResourceResult<()> {
        if self.sampler.is_none() {
            self.sampler = Some(backend.create_sampler(&SamplerDescriptor {
                label: Some("mipmap sampler".to_string()),
                address_mode_u: AddressMode::ClampToEdge,
                address_mode_v: AddressMode::ClampToEdge,
                address_mode_w: AddressMode::ClampToEdge,
                mag_filter: FilterMode::Linear,
                min_filter: FilterMode::Linear,
                mipmap_filter: FilterMode::Nearest,
                lod_min_clamp: 0.0,
                lod_max_clamp: 0.0,
            })?);
        }
        for format in self.formats.clone() {
            if self.programs.contains_key(&format) {
                continue;
            }
            let mut program = Self::program(format);
            program.link(backend, library)?;
            self.programs.insert(format, program);
        }
        Ok(())
    }

    /// Fill mips 1.. of every layer of `texture` from its mip 0
    pub fn generate(&mut self, backend: &mut dyn GraphicsBackend, texture: &mut Texture) -> ResourceResult<()> {
        if !texture.is_base_level_complete() {
            return Err(ResourceError::BaseLevelIncomplete(texture.label().to_string()));
        }
        let sampler = self
            .sampler
            .ok_or_else(|| ResourceError::NotLinked("mipmap sampler".to_string()))?;
        let program = self
            .programs
            .get_mut(&texture.format())
            .ok_or_else(|| ResourceError::NotLinked(format!("mipmap {:?}", texture.format())))?;

        let faces: Vec<Option<CubeFace>> = match texture.kind() {
            TextureKind::D2 => vec![None],
            TextureKind::Cube => CubeFace::ALL.iter().copied().map(Some).collect(),
        };

        program.bind()?;
        let result = render_chain(backend, program, &mut self.target, &self.triangle, texture, &faces, sampler);
        self.target.detach_color();
        program.unbind(backend);
        result
    }

    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, mut program) in self.programs.drain() {
            program.destroy(backend);
        }
        if let Some(sampler) = self.sampler.take() {
            backend.destroy_sampler(sampler);
        }
        self.target.destroy(backend);
    }
}

fn render_chain(
    backend: &mut dyn GraphicsBackend,
    program: &mut ShaderProgram,
    target: &mut RenderTarget,
    triangle: &DrawPrimitive,
    texture: &mut Texture,
    faces: &[Option<CubeFace>],
    sampler: SamplerHandle,
) -> ResourceResult<()> {
    for mip in 1..texture.mip_levels() {
        for face in faces {
            let source = texture.layer_view(backend, *face, mip - 1)?;
            program.bind_texture_view("source_level", source, sampler)?;
            target.attach_color(backend, texture, *face, mip)?;
            program.draw(backend, target, triangle, Some([0.0; 4]))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, DummyCommand};
    use crate::resources::texture::TextureSpec;

    #[test]
    fn test_generates_every_mip_of_every_face() {
        let mut backend = DummyBackend::new();
        let library = ShaderLibrary::standard();
        let mut mipmapper = Mipmapper::new([TextureFormat::Rgba16Float]);
        mipmapper.link(&mut backend, &library).unwrap();

        let mut cube = Texture::create(
            &mut backend,
            TextureSpec::cube("env", 16, TextureFormat::Rgba16Float, 5),
        )
        .unwrap();
        assert!(matches!(
            cube.generate_mipmaps(&mut backend, &mut mipmapper),
            Err(ResourceError::BaseLevelIncomplete(_))
        ));

        let face = vec![0u8; 16 * 16 * 8];
        for f in CubeFace::ALL {
            cube.write_face(&mut backend, Some(f), 0, &face).unwrap();
        }
        backend.clear_commands();
        cube.generate_mipmaps(&mut backend, &mut mipmapper).unwrap();

        let passes: Vec<(u32, u32, u32)> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                DummyCommand::BeginRenderPass { color, .. } => {
                    Some((color[0].mip_level, color[0].array_layer, color[0].width))
                }
                _ => None,
            })
            .collect();
        assert_eq!(passes.len(), 4 * 6);
        assert_eq!(passes[0], (1, 0, 8));
        assert_eq!(passes[6], (2, 0, 4));
        assert_eq!(passes[23], (4, 5, 1));
        assert!(backend.submit().is_ok());

        cube.destroy(&mut backend);
        mipmapper.destroy(&mut backend);
        assert_eq!(backend.live_pipelines(), 0);
        assert_eq!(backend.live_texture_views(), 0);
    }

    #[test]
    fn test_unsupported_format_is_reported() {
        let mut backend = DummyBackend::new();
        let mut mipmapper = Mipmapper::new([TextureFormat::Rgba8Unorm]);
        mipmapper.link(&mut backend, &ShaderLibrary::standard()).unwrap();

        let mut texture = Texture::create(
            &mut backend,
            TextureSpec::d2("half", 8, 8, TextureFormat::Rgba16Float),
        )
        .unwrap();
        texture
            .write_face(&mut backend, None, 0, &vec![0u8; 8 * 8 * 8])
            .unwrap();
        assert!(matches!(
            mipmapper.generate(&mut backend, &mut texture),
            Err(ResourceError::NotLinked(_))
        ));

        texture.destroy(&mut backend);
        mipmapper.destroy(&mut backend);
    }
}
