//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations. It hands out handles, tracks
//! which resources are alive, and records every command so tests can check the exact
//! order of passes, copies and uniform writes without GPU hardware. Readbacks return
//! zeroed texels.

use std::collections::HashMap;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Operation that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateTexture,
    CreateTextureView,
    CreateBindGroup,
    CreateRenderPipeline,
    CreateComputePipeline,
    Submit,
}

/// Texture subresource a render pass writes to
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRecord {
    pub texture: u64,
    pub label: Option<String>,
    pub mip_level: u32,
    pub array_layer: u32,
    pub width: u32,
    pub height: u32,
}

/// Recorded command
#[derive(Debug, Clone, PartialEq)]
pub enum DummyCommand {
    WriteBuffer {
        buffer: u64,
        offset: u64,
        data: Vec<u8>,
    },
    WriteTexture {
        texture: u64,
        mip_level: u32,
        array_layer: u32,
        bytes: usize,
    },
    CopyTexture {
        src: u64,
        src_mip: u32,
        dst: u64,
        dst_mip: u32,
        extent: Extent3d,
    },
    BeginRenderPass {
        label: Option<String>,
        color: Vec<AttachmentRecord>,
        depth: Option<AttachmentRecord>,
    },
    EndRenderPass,
    BeginComputePass {
        label: Option<String>,
    },
    EndComputePass,
    SetRenderPipeline(u64),
    SetComputePipeline(u64),
    SetBindGroup {
        index: u32,
        bind_group: u64,
    },
    SetViewport {
        width: f32,
        height: f32,
    },
    Draw {
        vertex_count: u32,
    },
    DrawIndexed {
        index_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    Submit,
}

/// Dummy GPU backend.
#[derive(Debug, Default)]
pub struct DummyBackend {
    next_id: u64,
    buffers: HashMap<u64, BufferDescriptor>,
    textures: HashMap<u64, TextureDescriptor>,
    views: HashMap<u64, (u64, TextureViewDescriptor)>,
    samplers: HashMap<u64, SamplerDescriptor>,
    bind_group_layouts: HashMap<u64, Vec<BindGroupLayoutEntry>>,
    bind_groups: HashMap<u64, Vec<(u32, BindGroupEntry)>>,
    render_pipelines: HashMap<u64, Option<String>>,
    compute_pipelines: HashMap<u64, Option<String>>,
    commands: Vec<DummyCommand>,
    pending_error: Option<String>,
    calls: HashMap<FailPoint, usize>,
    failures: Vec<(FailPoint, usize)>,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` (zero-based, counted from now) call of `point` fail.
    pub fn fail_on(&mut self, point: FailPoint, nth: usize) {
        let seen = self.calls.get(&point).copied().unwrap_or(0);
        self.failures.push((point, seen + nth));
    }

    /// Commands recorded so far
    pub fn commands(&self) -> &[DummyCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_texture_views(&self) -> usize {
        self.views.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_samplers(&self) -> usize {
        self.samplers.len()
    }

    pub fn live_bind_groups(&self) -> usize {
        self.bind_groups.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.render_pipelines.len() + self.compute_pipelines.len()
    }

    /// Descriptor of a live texture
    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    /// Descriptor of a live sampler
    pub fn sampler_descriptor(&self, sampler: SamplerHandle) -> Option<&SamplerDescriptor> {
        self.samplers.get(&sampler.0)
    }

    /// Texture and descriptor behind a live view
    pub fn view_descriptor(&self, view: TextureViewHandle) -> Option<(u64, &TextureViewDescriptor)> {
        self.views.get(&view.0).map(|(texture, desc)| (*texture, desc))
    }

    /// Entries of a live bind group
    pub fn bind_group_entries(&self, bind_group: u64) -> Option<&[(u32, BindGroupEntry)]> {
        self.bind_groups.get(&bind_group).map(Vec::as_slice)
    }

    /// Label the texture with id `texture` was created with
    pub fn texture_label(&self, texture: u64) -> Option<&str> {
        self.textures.get(&texture).and_then(|d| d.label.as_deref())
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check(&mut self, point: FailPoint) -> Result<(), String> {
        let count = self.calls.entry(point).or_insert(0);
        let index = *count;
        *count += 1;
        if let Some(pos) = self
            .failures
            .iter()
            .position(|&(p, n)| p == point && n == index)
        {
            self.failures.remove(pos);
            return Err(format!("injected failure at {point:?} #{index}"));
        }
        Ok(())
    }

    fn attachment(&self, view: TextureViewHandle) -> Option<AttachmentRecord> {
        let (texture, desc) = self.views.get(&view.0)?;
        let texture_desc = self.textures.get(texture)?;
        Some(AttachmentRecord {
            texture: *texture,
            label: texture_desc.label.clone(),
            mip_level: desc.base_mip_level,
            array_layer: desc.base_array_layer,
            width: (texture_desc.width >> desc.base_mip_level).max(1),
            height: (texture_desc.height >> desc.base_mip_level).max(1),
        })
    }
}

impl GraphicsBackend for DummyBackend {
    fn name(&self) -> &str {
        "Dummy Backend"
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!("DummyBackend: creating buffer {:?} (size: {})", desc.label, desc.size);
        let id = self.allocate_id();
        self.buffers.insert(id, desc.clone());
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        let mut desc = desc.clone();
        desc.size = data.len() as u64;
        self.create_buffer(&desc)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        if !self.buffers.contains_key(&buffer.0) {
            return Err(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            });
        }
        self.commands.push(DummyCommand::WriteBuffer {
            buffer: buffer.0,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, _offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        if !self.buffers.contains_key(&buffer.0) {
            return Err(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            });
        }
        self.submit()?;
        Ok(vec![0; size as usize])
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        self.check(FailPoint::CreateTexture)
            .map_err(BackendError::TextureCreationFailed)?;
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{}, {} mips)",
            desc.label,
            desc.width,
            desc.height,
            desc.array_layers,
            desc.mip_levels
        );
        let id = self.allocate_id();
        self.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        self.check(FailPoint::CreateTextureView)
            .map_err(BackendError::TextureViewCreationFailed)?;
        let Some(texture_desc) = self.textures.get(&texture.0) else {
            return Err(BackendError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            });
        };
        if desc.base_mip_level + desc.mip_level_count > texture_desc.mip_levels
            || desc.base_array_layer + desc.array_layer_count > texture_desc.array_layers
        {
            return Err(BackendError::TextureViewCreationFailed(format!(
                "view {desc:?} exceeds texture {:?}",
                texture_desc.label
            )));
        }
        let id = self.allocate_id();
        self.views.insert(id, (texture.0, desc.clone()));
        Ok(TextureViewHandle(id))
    }

    fn write_texture(
        &mut self,
        dst: TextureCopyLocation,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let Some(desc) = self.textures.get(&dst.texture.0) else {
            return Err(BackendError::InvalidHandle {
                kind: "texture",
                id: dst.texture.0,
            });
        };
        let expected = (width * height * desc.format.bytes_per_pixel()) as usize;
        if data.len() != expected {
            return Err(BackendError::UploadFailed(format!(
                "expected {expected} bytes, got {}",
                data.len()
            )));
        }
        self.commands.push(DummyCommand::WriteTexture {
            texture: dst.texture.0,
            mip_level: dst.mip_level,
            array_layer: dst.base_array_layer,
            bytes: data.len(),
        });
        Ok(())
    }

    fn copy_texture_to_texture(
        &mut self,
        src: TextureCopyLocation,
        dst: TextureCopyLocation,
        extent: Extent3d,
    ) -> BackendResult<()> {
        for handle in [src.texture, dst.texture] {
            if !self.textures.contains_key(&handle.0) {
                return Err(BackendError::InvalidHandle {
                    kind: "texture",
                    id: handle.0,
                });
            }
        }
        self.commands.push(DummyCommand::CopyTexture {
            src: src.texture.0,
            src_mip: src.mip_level,
            dst: dst.texture.0,
            dst_mip: dst.mip_level,
            extent,
        });
        Ok(())
    }

    fn read_texture(
        &mut self,
        src: TextureCopyLocation,
        width: u32,
        height: u32,
    ) -> BackendResult<Vec<u8>> {
        let bytes_per_pixel = self
            .textures
            .get(&src.texture.0)
            .map(|d| d.format.bytes_per_pixel())
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                id: src.texture.0,
            })?;
        self.submit()?;
        Ok(vec![0; (width * height * bytes_per_pixel) as usize])
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("DummyBackend: creating sampler {:?}", desc.label);
        let id = self.allocate_id();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let id = self.allocate_id();
        self.bind_group_layouts.insert(id, entries.to_vec());
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        self.check(FailPoint::CreateBindGroup)
            .map_err(BackendError::BindGroupCreationFailed)?;
        let Some(layout_entries) = self.bind_group_layouts.get(&layout.0) else {
            return Err(BackendError::InvalidHandle {
                kind: "bind group layout",
                id: layout.0,
            });
        };
        if let Some(missing) = layout_entries
            .iter()
            .find(|l| !entries.iter().any(|(binding, _)| *binding == l.binding))
        {
            return Err(BackendError::BindGroupCreationFailed(format!(
                "binding {} declared in the layout has no resource",
                missing.binding
            )));
        }
        let id = self.allocate_id();
        self.bind_groups.insert(id, entries.to_vec());
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        self.check(FailPoint::CreateRenderPipeline)
            .map_err(BackendError::PipelineCreationFailed)?;
        let id = self.allocate_id();
        self.render_pipelines.insert(id, desc.label.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        self.check(FailPoint::CreateComputePipeline)
            .map_err(BackendError::PipelineCreationFailed)?;
        let id = self.allocate_id();
        self.compute_pipelines.insert(id, desc.label.clone());
        Ok(ComputePipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        let color: Vec<AttachmentRecord> = desc
            .color_attachments
            .iter()
            .filter_map(|a| self.attachment(a.view))
            .collect();
        let depth = desc
            .depth_stencil_attachment
            .as_ref()
            .and_then(|d| self.attachment(d.view));

        let sizes = color
            .iter()
            .chain(depth.iter())
            .map(|a| (a.width, a.height))
            .collect::<Vec<_>>();
        if sizes.windows(2).any(|w| w[0] != w[1]) {
            self.pending_error = Some(format!(
                "render pass {:?} has attachments of different sizes: {sizes:?}",
                desc.label
            ));
        }

        self.commands.push(DummyCommand::BeginRenderPass {
            label: desc.label.clone(),
            color,
            depth,
        });
    }

    fn end_render_pass(&mut self) {
        self.commands.push(DummyCommand::EndRenderPass);
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.commands.push(DummyCommand::BeginComputePass {
            label: label.map(str::to_string),
        });
    }

    fn end_compute_pass(&mut self) {
        self.commands.push(DummyCommand::EndComputePass);
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.commands.push(DummyCommand::SetRenderPipeline(pipeline.0));
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.commands.push(DummyCommand::SetComputePipeline(pipeline.0));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        self.commands.push(DummyCommand::SetBindGroup {
            index,
            bind_group: bind_group.0,
        });
    }

    fn set_vertex_buffer(&mut self, _slot: u32, _buffer: BufferHandle, _offset: u64) {}

    fn set_index_buffer(&mut self, _buffer: BufferHandle, _offset: u64, _format: IndexFormat) {}

    fn set_viewport(&mut self, _x: f32, _y: f32, width: f32, height: f32, _min_depth: f32, _max_depth: f32) {
        self.commands.push(DummyCommand::SetViewport { width, height });
    }

    fn draw(&mut self, vertices: std::ops::Range<u32>, _instances: std::ops::Range<u32>) {
        self.commands.push(DummyCommand::Draw {
            vertex_count: vertices.len() as u32,
        });
    }

    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        _base_vertex: i32,
        _instances: std::ops::Range<u32>,
    ) {
        self.commands.push(DummyCommand::DrawIndexed {
            index_count: indices.len() as u32,
        });
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(DummyCommand::Dispatch { x, y, z });
    }

    fn submit(&mut self) -> BackendResult<()> {
        self.commands.push(DummyCommand::Submit);
        self.check(FailPoint::Submit)
            .map_err(BackendError::SubmissionFailed)?;
        match self.pending_error.take() {
            Some(message) => Err(BackendError::SubmissionFailed(message)),
            None => Ok(()),
        }
    }

    fn wait_idle(&mut self) {}

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.views.remove(&view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        self.bind_group_layouts.remove(&layout.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.render_pipelines.remove(&pipeline.0);
    }

    fn destroy_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.compute_pipelines.remove(&pipeline.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_descriptor() -> TextureDescriptor {
        TextureDescriptor {
            label: Some("cube".into()),
            width: 64,
            height: 64,
            array_layers: 6,
            mip_levels: 7,
            format: TextureFormat::Rgba16Float,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::RENDER_ATTACHMENT,
        }
    }

    fn face_view(mip: u32, layer: u32) -> TextureViewDescriptor {
        TextureViewDescriptor {
            label: None,
            dimension: TextureViewDimension::D2,
            base_mip_level: mip,
            mip_level_count: 1,
            base_array_layer: layer,
            array_layer_count: 1,
        }
    }

    #[test]
    fn test_injected_failure_hits_only_the_requested_call() {
        let mut backend = DummyBackend::new();
        backend.fail_on(FailPoint::CreateTexture, 1);

        assert!(backend.create_texture(&cube_descriptor()).is_ok());
        assert!(matches!(
            backend.create_texture(&cube_descriptor()),
            Err(BackendError::TextureCreationFailed(_))
        ));
        assert!(backend.create_texture(&cube_descriptor()).is_ok());
        assert_eq!(backend.live_textures(), 2);
    }

    #[test]
    fn test_view_outside_texture_is_rejected() {
        let mut backend = DummyBackend::new();
        let texture = backend.create_texture(&cube_descriptor()).unwrap();

        assert!(backend.create_texture_view(texture, &face_view(6, 5)).is_ok());
        assert!(backend.create_texture_view(texture, &face_view(7, 0)).is_err());
        assert!(backend.create_texture_view(texture, &face_view(0, 6)).is_err());
    }

    #[test]
    fn test_mismatched_attachments_fail_at_submit() {
        let mut backend = DummyBackend::new();
        let texture = backend.create_texture(&cube_descriptor()).unwrap();
        let depth = backend
            .create_texture(&TextureDescriptor {
                label: Some("depth".into()),
                width: 64,
                height: 64,
                format: TextureFormat::Depth32Float,
                usage: TextureUsage::RENDER_ATTACHMENT,
                ..Default::default()
            })
            .unwrap();
        let color_view = backend.create_texture_view(texture, &face_view(1, 0)).unwrap();
        let depth_view = backend.create_texture_view(depth, &face_view(0, 0)).unwrap();

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("mismatch".into()),
            color_attachments: vec![ColorAttachment {
                view: color_view,
                load_op: LoadOp::Clear([0.0; 4]),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth_view,
                depth_load_op: LoadOp::Clear([1.0; 4]),
                depth_store_op: StoreOp::Discard,
                depth_clear_value: 1.0,
            }),
        });
        backend.end_render_pass();

        assert!(matches!(backend.submit(), Err(BackendError::SubmissionFailed(_))));
        assert!(backend.submit().is_ok());
    }
}
