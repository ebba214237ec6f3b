//! Shader programs: stages picked from the shader library, linked into one pipeline
//! with a typed interface of uniforms, sampled textures and storage images.
//!
//! Every program uses bind group 0. The uniform block (if any) sits at binding 0, a
//! sampled texture at binding `b` gets its sampler at `b + 1`, storage images take the
//! binding they declare.

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::*;

use super::error::{ResourceError, ResourceResult};
use super::mesh::DrawPrimitive;
use super::render_target::RenderTarget;
use super::shader_library::ShaderLibrary;
use super::texture::{CubeFace, Texture};

const UNIFORM_BINDING: u32 = 0;

/// Entry point name each stage must define
pub fn entry_point(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "vs_main",
        ShaderStage::Fragment => "fs_main",
        ShaderStage::Compute => "main",
    }
}

/// Number of work groups of `local_size` needed to cover `dimension` invocations.
///
/// # Panics
/// If `local_size` is zero.
pub fn workgroup_count(dimension: u32, local_size: u32) -> u32 {
    assert!(local_size > 0, "work group size must be non-zero");
    dimension.div_ceil(local_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformType {
    F32,
    U32,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
}

impl UniformType {
    fn size(self) -> u64 {
        match self {
            Self::F32 | Self::U32 => 4,
            Self::Vec2 => 8,
            Self::Vec3 => 12,
            Self::Vec4 => 16,
            Self::Mat4 => 64,
        }
    }

    fn align(self) -> u64 {
        match self {
            Self::F32 | Self::U32 => 4,
            Self::Vec2 => 8,
            Self::Vec3 | Self::Vec4 | Self::Mat4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    F32(f32),
    U32(u32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl UniformValue {
    pub fn ty(&self) -> UniformType {
        match self {
            Self::F32(_) => UniformType::F32,
            Self::U32(_) => UniformType::U32,
            Self::Vec2(_) => UniformType::Vec2,
            Self::Vec3(_) => UniformType::Vec3,
            Self::Vec4(_) => UniformType::Vec4,
            Self::Mat4(_) => UniformType::Mat4,
        }
    }

    fn write(&self, dst: &mut [u8]) {
        match self {
            Self::F32(v) => dst.copy_from_slice(bytemuck::bytes_of(v)),
            Self::U32(v) => dst.copy_from_slice(bytemuck::bytes_of(v)),
            Self::Vec2(v) => dst.copy_from_slice(bytemuck::bytes_of(v)),
            Self::Vec3(v) => dst.copy_from_slice(bytemuck::bytes_of(v)),
            Self::Vec4(v) => dst.copy_from_slice(bytemuck::bytes_of(v)),
            Self::Mat4(v) => dst.copy_from_slice(bytemuck::bytes_of(v)),
        }
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<u32> for UniformValue {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<Vec2> for UniformValue {
    fn from(v: Vec2) -> Self {
        Self::Vec2(v)
    }
}

impl From<Vec3> for UniformValue {
    fn from(v: Vec3) -> Self {
        Self::Vec3(v)
    }
}

impl From<Vec4> for UniformValue {
    fn from(v: Vec4) -> Self {
        Self::Vec4(v)
    }
}

impl From<Mat4> for UniformValue {
    fn from(v: Mat4) -> Self {
        Self::Mat4(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniformField {
    pub name: String,
    pub ty: UniformType,
    pub offset: u64,
}

/// Uniform struct laid out with WGSL uniform address space rules
#[derive(Debug, Clone, PartialEq)]
pub struct UniformBlock {
    fields: Vec<UniformField>,
    size: u64,
}

impl UniformBlock {
    pub fn new(fields: &[(&str, UniformType)]) -> Self {
        let mut offset: u64 = 0;
        let mut struct_align: u64 = 16;
        let mut laid_out = Vec::with_capacity(fields.len());
        for (name, ty) in fields {
            offset = offset.next_multiple_of(ty.align());
            laid_out.push(UniformField {
                name: name.to_string(),
                ty: *ty,
                offset,
            });
            offset += ty.size();
            struct_align = struct_align.max(ty.align());
        }
        Self {
            fields: laid_out,
            size: offset.max(1).next_multiple_of(struct_align),
        }
    }

    pub fn field(&self, name: &str) -> Option<&UniformField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[UniformField] {
        &self.fields
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Uninitialized,
    Linked,
    Destroyed,
}

struct TextureSlot {
    name: String,
    binding: u32,
    dimension: TextureViewDimension,
    bound: Option<(TextureViewHandle, SamplerHandle)>,
}

struct ImageSlot {
    name: String,
    binding: u32,
    format: TextureFormat,
    dimension: TextureViewDimension,
    access: StorageTextureAccess,
    bound: Option<TextureViewHandle>,
}

enum Pipeline {
    Render(RenderPipelineHandle),
    Compute(ComputePipelineHandle),
}

struct LinkedProgram {
    pipeline: Pipeline,
    layout: BindGroupLayoutHandle,
    uniform_buffer: Option<BufferHandle>,
    bind_groups: Vec<(Vec<(u32, BindGroupEntry)>, BindGroupHandle)>,
}

impl LinkedProgram {
    fn release(self, backend: &mut dyn GraphicsBackend) {
        for (_, bind_group) in self.bind_groups {
            backend.destroy_bind_group(bind_group);
        }
        match self.pipeline {
            Pipeline::Render(pipeline) => backend.destroy_render_pipeline(pipeline),
            Pipeline::Compute(pipeline) => backend.destroy_compute_pipeline(pipeline),
        }
        backend.destroy_bind_group_layout(self.layout);
        if let Some(buffer) = self.uniform_buffer {
            backend.destroy_buffer(buffer);
        }
    }
}

pub struct ShaderProgram {
    label: String,
    stages: Vec<(ShaderStage, String)>,
    uniforms: Option<UniformBlock>,
    uniform_data: Vec<u8>,
    uniforms_dirty: bool,
    textures: Vec<TextureSlot>,
    images: Vec<ImageSlot>,
    color_targets: Vec<TextureFormat>,
    depth_format: Option<TextureFormat>,
    vertex_layouts: Vec<VertexBufferLayout>,
    state: ProgramState,
    gpu: Option<LinkedProgram>,
    bound: bool,
}

impl ShaderProgram {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stages: Vec::new(),
            uniforms: None,
            uniform_data: Vec::new(),
            uniforms_dirty: false,
            textures: Vec::new(),
            images: Vec::new(),
            color_targets: Vec::new(),
            depth_format: None,
            vertex_layouts: Vec::new(),
            state: ProgramState::Uninitialized,
            gpu: None,
            bound: false,
        }
    }

    /// Add a stage whose source is the library module `tag`
    pub fn add_stage(&mut self, kind: ShaderStage, tag: impl Into<String>) -> &mut Self {
        self.stages.push((kind, tag.into()));
        self
    }

    pub fn with_stage(mut self, kind: ShaderStage, tag: impl Into<String>) -> Self {
        self.add_stage(kind, tag);
        self
    }

    pub fn with_uniforms(mut self, block: UniformBlock) -> Self {
        self.uniform_data = vec![0; block.size() as usize];
        self.uniforms = Some(block);
        self
    }

    /// Sampled texture at `binding`, its sampler at `binding + 1`
    pub fn with_texture(mut self, name: &str, binding: u32, dimension: TextureViewDimension) -> Self {
        self.textures.push(TextureSlot {
            name: name.to_string(),
            binding,
            dimension,
            bound: None,
        });
        self
    }

    pub fn with_image(
        mut self,
        name: &str,
        binding: u32,
        format: TextureFormat,
        dimension: TextureViewDimension,
        access: StorageTextureAccess,
    ) -> Self {
        self.images.push(ImageSlot {
            name: name.to_string(),
            binding,
            format,
            dimension,
            access,
            bound: None,
        });
        self
    }

    pub fn with_color_target(mut self, format: TextureFormat) -> Self {
        self.color_targets.push(format);
        self
    }

    pub fn with_depth(mut self, format: TextureFormat) -> Self {
        self.depth_format = Some(format);
        self
    }

    pub fn with_vertex_layouts(mut self, layouts: Vec<VertexBufferLayout>) -> Self {
        self.vertex_layouts = layouts;
        self
    }

    fn has_stage(&self, kind: ShaderStage) -> bool {
        self.stages.iter().any(|(k, _)| *k == kind)
    }

    fn is_compute(&self) -> bool {
        self.has_stage(ShaderStage::Compute)
    }

    fn check_stages(&self) -> ResourceResult<()> {
        let incompatible = |reason: &str| ResourceError::IncompatibleStages {
            program: self.label.clone(),
            reason: reason.to_string(),
        };
        let count = |kind| self.stages.iter().filter(|(k, _)| *k == kind).count();

        if self.stages.is_empty() {
            return Err(incompatible("no stages"));
        }
        if self.is_compute() {
            if self.stages.len() != 1 {
                return Err(incompatible("a compute stage cannot be combined with other stages"));
            }
            return Ok(());
        }
        if count(ShaderStage::Vertex) != 1 {
            return Err(incompatible("a raster program needs exactly one vertex stage"));
        }
        if count(ShaderStage::Fragment) > 1 {
            return Err(incompatible("more than one fragment stage"));
        }
        if !self.color_targets.is_empty() && !self.has_stage(ShaderStage::Fragment) {
            return Err(incompatible("color targets need a fragment stage"));
        }
        Ok(())
    }

    /// Parse and validate `source`, then check entry points and declared bindings against it
    fn validate_source(&self, source: &str) -> ResourceResult<()> {
        let compile_error = |message: String| ResourceError::ShaderCompile {
            program: self.label.clone(),
            message,
        };

        let module = naga::front::wgsl::parse_str(source).map_err(|e| compile_error(e.emit_to_string(source)))?;
        naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
            .validate(&module)
            .map_err(|e| compile_error(e.emit_to_string(source)))?;

        for (kind, tag) in &self.stages {
            let naga_stage = match kind {
                ShaderStage::Vertex => naga::ShaderStage::Vertex,
                ShaderStage::Fragment => naga::ShaderStage::Fragment,
                ShaderStage::Compute => naga::ShaderStage::Compute,
            };
            let name = entry_point(*kind);
            if !module
                .entry_points
                .iter()
                .any(|ep| ep.stage == naga_stage && ep.name == name)
            {
                return Err(compile_error(format!(
                    "stage '{tag}' has no {kind:?} entry point '{name}'"
                )));
            }
        }

        let declared: Vec<u32> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| var.binding.as_ref())
            .filter(|b| b.group == 0)
            .map(|b| b.binding)
            .collect();
        let expect = |binding: u32, name: &str, kind: &'static str| {
            if declared.contains(&binding) {
                Ok(())
            } else {
                Err(ResourceError::UnknownBinding {
                    program: self.label.clone(),
                    name: name.to_string(),
                    kind,
                })
            }
        };
        if self.uniforms.is_some() {
            expect(UNIFORM_BINDING, "uniforms", "uniform block")?;
        }
        for slot in &self.textures {
            expect(slot.binding, &slot.name, "texture")?;
            expect(slot.binding + 1, &slot.name, "sampler")?;
        }
        for slot in &self.images {
            expect(slot.binding, &slot.name, "storage image")?;
        }
        Ok(())
    }

    fn layout_entries(&self) -> Vec<BindGroupLayoutEntry> {
        let compute = self.is_compute();
        let uniform_visibility = if compute {
            ShaderStageFlags::COMPUTE
        } else {
            ShaderStageFlags::VERTEX_FRAGMENT
        };
        let resource_visibility = if compute {
            ShaderStageFlags::COMPUTE
        } else {
            ShaderStageFlags::FRAGMENT
        };

        let mut entries = Vec::new();
        if self.uniforms.is_some() {
            entries.push(BindGroupLayoutEntry {
                binding: UNIFORM_BINDING,
                visibility: uniform_visibility,
                ty: BindingType::UniformBuffer,
            });
        }
        for slot in &self.textures {
            entries.push(BindGroupLayoutEntry {
                binding: slot.binding,
                visibility: resource_visibility,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                    view_dimension: slot.dimension,
                },
            });
            entries.push(BindGroupLayoutEntry {
                binding: slot.binding + 1,
                visibility: resource_visibility,
                ty: BindingType::Sampler { filtering: true },
            });
        }
        for slot in &self.images {
            entries.push(BindGroupLayoutEntry {
                binding: slot.binding,
                visibility: resource_visibility,
                ty: BindingType::StorageTexture {
                    format: slot.format,
                    view_dimension: slot.dimension,
                    access: slot.access,
                },
            });
        }
        entries
    }

    /// Compile every stage and create the pipeline. A program links once.
    pub fn link(&mut self, backend: &mut dyn GraphicsBackend, library: &ShaderLibrary) -> ResourceResult<()> {
        if self.state != ProgramState::Uninitialized {
            return Err(ResourceError::AlreadyLinked(self.label.clone()));
        }
        self.check_stages()?;

        let tags: Vec<&str> = self.stages.iter().map(|(_, tag)| tag.as_str()).collect();
        let source = library.compose(&tags)?;
        self.validate_source(&source)?;

        let layout = backend.create_bind_group_layout(&self.layout_entries())?;
        let pipeline = match self.create_pipeline(backend, source, layout) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                backend.destroy_bind_group_layout(layout);
                return Err(err);
            }
        };
        let mut linked = LinkedProgram {
            pipeline,
            layout,
            uniform_buffer: None,
            bind_groups: Vec::new(),
        };

        if let Some(block) = &self.uniforms {
            match backend.create_buffer(&BufferDescriptor {
                label: Some(format!("{} uniforms", self.label)),
                size: block.size(),
                usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            }) {
                Ok(buffer) => linked.uniform_buffer = Some(buffer),
                Err(err) => {
                    linked.release(backend);
                    return Err(err.into());
                }
            }
            self.uniforms_dirty = true;
        }

        log::debug!("Linked program '{}' ({} stages)", self.label, self.stages.len());
        self.gpu = Some(linked);
        self.state = ProgramState::Linked;
        Ok(())
    }

    fn create_pipeline(
        &self,
        backend: &mut dyn GraphicsBackend,
        source: String,
        layout: BindGroupLayoutHandle,
    ) -> ResourceResult<Pipeline> {
        if self.is_compute() {
            let pipeline = backend.create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(self.label.clone()),
                shader: source,
                entry_point: entry_point(ShaderStage::Compute).to_string(),
                bind_group_layouts: vec![layout],
            })?;
            return Ok(Pipeline::Compute(pipeline));
        }

        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(self.label.clone()),
            shader: source,
            vertex_entry: entry_point(ShaderStage::Vertex).to_string(),
            fragment_entry: self
                .has_stage(ShaderStage::Fragment)
                .then(|| entry_point(ShaderStage::Fragment).to_string()),
            vertex_layouts: self.vertex_layouts.clone(),
            bind_group_layouts: vec![layout],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            // Captures look at the cube from inside
            cull_mode: CullMode::None,
            depth_stencil: self.depth_format.map(|format| DepthStencilState {
                format,
                depth_write_enabled: true,
                depth_compare: CompareFunction::LessEqual,
            }),
            color_targets: self
                .color_targets
                .iter()
                .map(|format| ColorTargetState {
                    format: *format,
                    write_mask: ColorWrites::ALL,
                })
                .collect(),
        })?;
        Ok(Pipeline::Render(pipeline))
    }

    /// Make the program current for draws and dispatches
    pub fn bind(&mut self) -> ResourceResult<()> {
        if self.state != ProgramState::Linked {
            return Err(ResourceError::NotLinked(self.label.clone()));
        }
        self.bound = true;
        Ok(())
    }

    /// Stop using the program and drop the bind groups created while it was bound
    pub fn unbind(&mut self, backend: &mut dyn GraphicsBackend) {
        self.bound = false;
        if let Some(gpu) = self.gpu.as_mut() {
            for (_, bind_group) in gpu.bind_groups.drain(..) {
                backend.destroy_bind_group(bind_group);
            }
        }
    }

    /// Set a uniform field. Unknown names and type mismatches log a warning and return `false`.
    pub fn set_uniform(&mut self, name: &str, value: impl Into<UniformValue>) -> bool {
        let value = value.into();
        let Some(field) = self.uniforms.as_ref().and_then(|b| b.field(name)) else {
            log::warn!("Program '{}' has no uniform '{name}'", self.label);
            return false;
        };
        if field.ty != value.ty() {
            log::warn!(
                "Uniform '{name}' of program '{}' is {:?}, got {:?}",
                self.label,
                field.ty,
                value.ty()
            );
            return false;
        }
        let start = field.offset as usize;
        let end = start + field.ty.size() as usize;
        value.write(&mut self.uniform_data[start..end]);
        self.uniforms_dirty = true;
        true
    }

    /// Sample `texture` through the slot `name`, with the texture's own sampler
    pub fn bind_texture(&mut self, name: &str, texture: &Texture) -> ResourceResult<()> {
        let view = texture.sample_view()?;
        let sampler = texture.sampler()?;
        self.bind_texture_view(name, view, sampler)
    }

    pub fn bind_texture_view(
        &mut self,
        name: &str,
        view: TextureViewHandle,
        sampler: SamplerHandle,
    ) -> ResourceResult<()> {
        let label = &self.label;
        let slot = self
            .textures
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| ResourceError::UnknownBinding {
                program: label.clone(),
                name: name.to_string(),
                kind: "texture",
            })?;
        slot.bound = Some((view, sampler));
        Ok(())
    }

    /// Expose one mip of `texture` for direct writes: all layers when `layered`,
    /// otherwise the single `face` (or the 2D layer)
    #[allow(clippy::too_many_arguments)]
    pub fn bind_image(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        texture: &mut Texture,
        mip: u32,
        layered: bool,
        face: Option<CubeFace>,
        access: StorageTextureAccess,
    ) -> ResourceResult<()> {
        let Some(index) = self.images.iter().position(|s| s.name == name) else {
            return Err(ResourceError::UnknownBinding {
                program: self.label.clone(),
                name: name.to_string(),
                kind: "storage image",
            });
        };
        let slot = &self.images[index];
        let mismatch = |reason: String| ResourceError::ImageBindingMismatch {
            name: name.to_string(),
            reason,
        };

        if slot.format != texture.format() {
            return Err(ResourceError::ImageFormatMismatch {
                name: name.to_string(),
                label: texture.label().to_string(),
                expected: slot.format,
                actual: texture.format(),
            });
        }
        if slot.access != access {
            return Err(mismatch(format!(
                "declared {:?}, requested {access:?}",
                slot.access
            )));
        }
        let slot_layered = slot.dimension == TextureViewDimension::D2Array;
        if slot_layered != layered {
            return Err(mismatch(format!(
                "declared {:?}, requested layered = {layered}",
                slot.dimension
            )));
        }
        if !texture.is_allocated() {
            return Err(ResourceError::NotAllocated(texture.label().to_string()));
        }

        let (view, layers) = if layered {
            (texture.layered_view(backend, mip)?, texture.kind().layer_count())
        } else {
            (texture.layer_view(backend, face, mip)?, 1)
        };
        if access != StorageTextureAccess::ReadOnly {
            let first = if layered { 0 } else { texture.layer_for(face)? };
            for layer in first..first + layers {
                texture.note_written(layer, mip);
            }
        }
        self.images[index].bound = Some(view);
        Ok(())
    }

    fn require_bound(&self) -> ResourceResult<()> {
        if self.state != ProgramState::Linked {
            return Err(ResourceError::NotLinked(self.label.clone()));
        }
        if !self.bound {
            return Err(ResourceError::NotBound(self.label.clone()));
        }
        Ok(())
    }

    fn bind_group_entries(&self) -> ResourceResult<Vec<(u32, BindGroupEntry)>> {
        let missing = |name: &str| ResourceError::MissingBinding {
            program: self.label.clone(),
            name: name.to_string(),
        };
        let mut entries = Vec::new();
        if let Some(buffer) = self.gpu.as_ref().and_then(|g| g.uniform_buffer) {
            entries.push((
                UNIFORM_BINDING,
                BindGroupEntry::Buffer {
                    buffer,
                    offset: 0,
                    size: None,
                },
            ));
        }
        for slot in &self.textures {
            let (view, sampler) = slot.bound.ok_or_else(|| missing(&slot.name))?;
            entries.push((slot.binding, BindGroupEntry::Texture(view)));
            entries.push((slot.binding + 1, BindGroupEntry::Sampler(sampler)));
        }
        for slot in &self.images {
            let view = slot.bound.ok_or_else(|| missing(&slot.name))?;
            entries.push((slot.binding, BindGroupEntry::StorageTexture(view)));
        }
        Ok(entries)
    }

    /// Upload pending uniform values and return a bind group for the current bindings
    fn prepare(&mut self, backend: &mut dyn GraphicsBackend) -> ResourceResult<BindGroupHandle> {
        let entries = self.bind_group_entries()?;
        let Some(gpu) = self.gpu.as_mut() else {
            return Err(ResourceError::NotLinked(self.label.clone()));
        };

        if self.uniforms_dirty {
            if let Some(buffer) = gpu.uniform_buffer {
                backend.write_buffer(buffer, 0, &self.uniform_data)?;
            }
            self.uniforms_dirty = false;
        }

        if let Some((_, bind_group)) = gpu.bind_groups.iter().find(|(e, _)| *e == entries) {
            return Ok(*bind_group);
        }
        let bind_group = backend.create_bind_group(gpu.layout, &entries)?;
        gpu.bind_groups.push((entries, bind_group));
        Ok(bind_group)
    }

    /// One render pass on `target` drawing `primitive`
    pub fn draw(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        target: &RenderTarget,
        primitive: &DrawPrimitive,
        clear: Option<[f32; 4]>,
    ) -> ResourceResult<()> {
        self.require_bound()?;
        let pipeline = match self.gpu.as_ref().map(|g| &g.pipeline) {
            Some(Pipeline::Render(pipeline)) => *pipeline,
            _ => {
                return Err(ResourceError::IncompatibleStages {
                    program: self.label.clone(),
                    reason: "draw needs a raster program".to_string(),
                })
            }
        };

        let format_mismatch = |attachment, expected, actual| ResourceError::TargetFormatMismatch {
            label: target.label().to_string(),
            program: self.label.clone(),
            attachment,
            expected,
            actual,
        };
        let color = self.color_targets.first().copied();
        if color != target.color_format() {
            return Err(format_mismatch("color", color, target.color_format()));
        }
        if self.depth_format != target.depth_format() {
            return Err(format_mismatch("depth", self.depth_format, target.depth_format()));
        }
        target.check_complete()?;

        // Queue writes must land before the pass is recorded
        let bind_group = self.prepare(backend)?;

        let (width, height) = target.begin_pass(backend, &self.label, clear)?;
        backend.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        backend.set_render_pipeline(pipeline);
        backend.set_bind_group(0, bind_group);
        primitive.render(backend);
        target.end_pass(backend);
        Ok(())
    }

    /// Dispatch enough work groups to cover `width` x `height`
    pub fn dispatch_compute_2d(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
        local_size_x: u32,
        local_size_y: u32,
    ) -> ResourceResult<()> {
        self.dispatch_compute_3d(backend, width, height, 1, local_size_x, local_size_y, 1)
    }

    /// Dispatch enough work groups to cover `width` x `height` x `depth`
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_compute_3d(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
        depth: u32,
        local_size_x: u32,
        local_size_y: u32,
        local_size_z: u32,
    ) -> ResourceResult<()> {
        let groups = (
            workgroup_count(width, local_size_x),
            workgroup_count(height, local_size_y),
            workgroup_count(depth, local_size_z),
        );
        self.require_bound()?;
        let pipeline = match self.gpu.as_ref().map(|g| &g.pipeline) {
            Some(Pipeline::Compute(pipeline)) => *pipeline,
            _ => {
                return Err(ResourceError::IncompatibleStages {
                    program: self.label.clone(),
                    reason: "dispatch needs a compute program".to_string(),
                })
            }
        };

        let bind_group = self.prepare(backend)?;

        backend.begin_compute_pass(Some(&self.label));
        backend.set_compute_pipeline(pipeline);
        backend.set_bind_group(0, bind_group);
        backend.dispatch_compute(groups.0, groups.1, groups.2);
        backend.end_compute_pass();
        Ok(())
    }

    /// Release the pipeline and everything created for it. Safe to call repeatedly.
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(gpu) = self.gpu.take() {
            log::debug!("Destroying program '{}'", self.label);
            gpu.release(backend);
        }
        self.bound = false;
        self.state = ProgramState::Destroyed;
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        if self.gpu.is_some() {
            log::warn!("Program '{}' dropped without destroy()", self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, DummyCommand, FailPoint};
    use crate::resources::texture::TextureSpec;

    const FILL_COMPUTE: &str = "
struct Params { value: f32, size: u32 }
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(3) var output_cube: texture_storage_2d_array<rgba16float, write>;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= params.size || id.y >= params.size { return; }
    textureStore(output_cube, id.xy, id.z, vec4<f32>(params.value));
}
";

    fn library() -> ShaderLibrary {
        ShaderLibrary::standard()
            .with_module("test.fill", FILL_COMPUTE, &[])
            .with_module("test.broken", "fn main( {", &[])
    }

    fn fill_program() -> ShaderProgram {
        ShaderProgram::new("fill")
            .with_stage(ShaderStage::Compute, "test.fill")
            .with_uniforms(UniformBlock::new(&[
                ("value", UniformType::F32),
                ("size", UniformType::U32),
            ]))
            .with_image(
                "output_cube",
                3,
                TextureFormat::Rgba16Float,
                TextureViewDimension::D2Array,
                StorageTextureAccess::WriteOnly,
            )
    }

    #[test]
    fn test_workgroup_count_covers_exactly() {
        for dimension in 1..=300 {
            for local in [1, 3, 8, 16, 32] {
                let groups = workgroup_count(dimension, local);
                assert!(groups * local >= dimension);
                assert!((groups - 1) * local < dimension);
            }
        }
        assert_eq!(workgroup_count(0, 16), 0);
        assert_eq!(workgroup_count(32, 16), 2);
        assert_eq!(workgroup_count(33, 16), 3);
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn test_zero_local_size_is_fatal() {
        workgroup_count(16, 0);
    }

    #[test]
    fn test_uniform_block_follows_wgsl_layout() {
        let block = UniformBlock::new(&[
            ("projection", UniformType::Mat4),
            ("view", UniformType::Mat4),
            ("roughness", UniformType::F32),
            ("environment_size", UniformType::F32),
            ("sample_count", UniformType::U32),
            ("sample_delta", UniformType::F32),
            ("face_size", UniformType::U32),
        ]);
        let offsets: Vec<u64> = block.fields().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 64, 128, 132, 136, 140, 144]);
        assert_eq!(block.size(), 160);

        let mixed = UniformBlock::new(&[("a", UniformType::F32), ("b", UniformType::Vec3), ("c", UniformType::F32)]);
        let offsets: Vec<u64> = mixed.fields().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 16, 28]);
        assert_eq!(mixed.size(), 32);
    }

    #[test]
    fn test_set_uniform_ignores_unknown_names() {
        let mut program = fill_program();
        assert!(program.set_uniform("value", 2.0f32));
        assert!(!program.set_uniform("valeu", 2.0f32));
        assert!(!program.set_uniform("size", 2.0f32));
        assert_eq!(&program.uniform_data[0..4], &2.0f32.to_le_bytes());
    }

    #[test]
    fn test_state_machine() {
        let mut backend = DummyBackend::new();
        let mut program = fill_program();
        assert_eq!(program.state(), ProgramState::Uninitialized);
        assert!(matches!(program.bind(), Err(ResourceError::NotLinked(_))));

        program.link(&mut backend, &library()).unwrap();
        assert_eq!(program.state(), ProgramState::Linked);
        assert!(matches!(
            program.link(&mut backend, &library()),
            Err(ResourceError::AlreadyLinked(_))
        ));

        program.destroy(&mut backend);
        program.destroy(&mut backend);
        assert_eq!(program.state(), ProgramState::Destroyed);
        assert!(matches!(
            program.link(&mut backend, &library()),
            Err(ResourceError::AlreadyLinked(_))
        ));
        assert_eq!(backend.live_pipelines(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_link_rejects_bad_stage_sets() {
        let mut backend = DummyBackend::new();
        let library = library();

        let mut fragment_only = ShaderProgram::new("fragment only")
            .with_stage(ShaderStage::Fragment, "mipmap.fragment")
            .with_color_target(TextureFormat::Rgba16Float);
        assert!(matches!(
            fragment_only.link(&mut backend, &library),
            Err(ResourceError::IncompatibleStages { .. })
        ));

        let mut mixed = ShaderProgram::new("mixed")
            .with_stage(ShaderStage::Compute, "test.fill")
            .with_stage(ShaderStage::Vertex, "fullscreen.vertex");
        assert!(matches!(
            mixed.link(&mut backend, &library),
            Err(ResourceError::IncompatibleStages { .. })
        ));

        let mut broken = ShaderProgram::new("broken").with_stage(ShaderStage::Compute, "test.broken");
        assert!(matches!(
            broken.link(&mut backend, &library),
            Err(ResourceError::ShaderCompile { .. })
        ));

        let mut wrong_entry = ShaderProgram::new("wrong entry").with_stage(ShaderStage::Compute, "mipmap.fragment");
        assert!(matches!(
            wrong_entry.link(&mut backend, &library),
            Err(ResourceError::ShaderCompile { .. })
        ));

        assert_eq!(backend.live_pipelines(), 0);
    }

    #[test]
    fn test_link_checks_declared_bindings() {
        let mut backend = DummyBackend::new();
        let mut program = fill_program().with_texture("environment_map", 1, TextureViewDimension::Cube);
        assert!(matches!(
            program.link(&mut backend, &library()),
            Err(ResourceError::UnknownBinding { kind: "texture", .. })
        ));
    }

    #[test]
    fn test_pipeline_failure_releases_layout() {
        let mut backend = DummyBackend::new();
        backend.fail_on(FailPoint::CreateComputePipeline, 0);
        let mut program = fill_program();
        assert!(program.link(&mut backend, &library()).is_err());
        assert_eq!(program.state(), ProgramState::Uninitialized);
        assert!(program.link(&mut backend, &library()).is_ok());
        program.destroy(&mut backend);
    }

    #[test]
    fn test_dispatch_writes_uniforms_then_covers_layers() {
        let mut backend = DummyBackend::new();
        let mut cube = Texture::create(
            &mut backend,
            TextureSpec::cube("target", 20, TextureFormat::Rgba16Float, 1),
        )
        .unwrap();
        let mut program = fill_program();
        program.link(&mut backend, &library()).unwrap();

        assert!(matches!(
            program.dispatch_compute_3d(&mut backend, 20, 20, 6, 8, 8, 1),
            Err(ResourceError::NotBound(_))
        ));
        program.bind().unwrap();
        assert!(matches!(
            program.dispatch_compute_3d(&mut backend, 20, 20, 6, 8, 8, 1),
            Err(ResourceError::MissingBinding { .. })
        ));

        program
            .bind_image(
                &mut backend,
                "output_cube",
                &mut cube,
                0,
                true,
                None,
                StorageTextureAccess::WriteOnly,
            )
            .unwrap();
        assert!(cube.is_base_level_complete());
        program.set_uniform("value", 1.0f32);
        program.set_uniform("size", 20u32);
        backend.clear_commands();
        program.dispatch_compute_3d(&mut backend, 20, 20, 6, 8, 8, 1).unwrap();

        let commands = backend.commands();
        assert!(matches!(commands[0], DummyCommand::WriteBuffer { .. }));
        assert!(commands.contains(&DummyCommand::Dispatch { x: 3, y: 3, z: 6 }));

        // Unchanged uniforms and bindings reuse the upload and the bind group
        backend.clear_commands();
        program.dispatch_compute_2d(&mut backend, 20, 20, 8, 8).unwrap();
        assert!(!backend
            .commands()
            .iter()
            .any(|c| matches!(c, DummyCommand::WriteBuffer { .. })));
        assert_eq!(backend.live_bind_groups(), 1);

        program.unbind(&mut backend);
        assert_eq!(backend.live_bind_groups(), 0);
        program.destroy(&mut backend);
        cube.destroy(&mut backend);
    }

    #[test]
    fn test_bind_image_checks_declaration() {
        let mut backend = DummyBackend::new();
        let mut program = fill_program();
        let mut rg = Texture::create(
            &mut backend,
            TextureSpec::d2("lut", 4, 4, TextureFormat::Rg16Float),
        )
        .unwrap();
        let mut cube = Texture::create(
            &mut backend,
            TextureSpec::cube("cube", 4, TextureFormat::Rgba16Float, 1),
        )
        .unwrap();

        assert!(matches!(
            program.bind_image(&mut backend, "output_cube", &mut rg, 0, true, None, StorageTextureAccess::WriteOnly),
            Err(ResourceError::ImageFormatMismatch { .. })
        ));
        assert!(matches!(
            program.bind_image(
                &mut backend,
                "output_cube",
                &mut cube,
                0,
                false,
                Some(CubeFace::PositiveX),
                StorageTextureAccess::WriteOnly
            ),
            Err(ResourceError::ImageBindingMismatch { .. })
        ));
        assert!(matches!(
            program.bind_image(&mut backend, "output_cube", &mut cube, 0, true, None, StorageTextureAccess::ReadWrite),
            Err(ResourceError::ImageBindingMismatch { .. })
        ));
        assert!(matches!(
            program.bind_image(&mut backend, "output", &mut cube, 0, true, None, StorageTextureAccess::WriteOnly),
            Err(ResourceError::UnknownBinding { .. })
        ));

        rg.destroy(&mut backend);
        cube.destroy(&mut backend);
    }

    #[test]
    fn test_every_probe_program_validates() {
        use crate::probe::shared::program_descriptions;

        let mut backend = DummyBackend::new();
        let library = ShaderLibrary::standard();
        for mut program in program_descriptions() {
            program
                .link(&mut backend, &library)
                .unwrap_or_else(|e| panic!("{}: {e}", program.label()));
            program.destroy(&mut backend);
        }
    }
}
