//! Capture surface: one retargetable color slot plus a depth buffer resized on demand

use crate::backend::*;

use super::error::{ResourceError, ResourceResult};
use super::texture::{CubeFace, Texture};

struct DepthBuffer {
    texture: TextureHandle,
    view: TextureViewHandle,
    width: u32,
    height: u32,
}

#[derive(Debug, Clone)]
struct ColorSlot {
    view: TextureViewHandle,
    format: TextureFormat,
    width: u32,
    height: u32,
    texture_label: String,
    face: Option<CubeFace>,
    mip: u32,
}

pub struct RenderTarget {
    label: String,
    depth_format: Option<TextureFormat>,
    depth: Option<DepthBuffer>,
    color: Option<ColorSlot>,
}

impl RenderTarget {
    /// Surface without storage; `resize` allocates the depth buffer
    pub fn new(label: impl Into<String>, depth_format: Option<TextureFormat>) -> Self {
        Self {
            label: label.into(),
            depth_format,
            depth: None,
            color: None,
        }
    }

    /// Reallocate the depth buffer at `width` x `height`. No-op when the size is unchanged.
    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> ResourceResult<()> {
        assert!(width > 0 && height > 0, "render target '{}' resized to zero", self.label);
        let Some(format) = self.depth_format else {
            return Ok(());
        };
        if matches!(&self.depth, Some(d) if d.width == width && d.height == height) {
            return Ok(());
        }
        self.release_depth(backend);

        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(format!("{} depth", self.label)),
            width,
            height,
            array_layers: 1,
            mip_levels: 1,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT,
        })?;
        let view = match backend.create_texture_view(
            texture,
            &TextureViewDescriptor {
                label: Some(format!("{} depth view", self.label)),
                dimension: TextureViewDimension::D2,
                base_mip_level: 0,
                mip_level_count: 1,
                base_array_layer: 0,
                array_layer_count: 1,
            },
        ) {
            Ok(view) => view,
            Err(err) => {
                backend.destroy_texture(texture);
                return Err(err.into());
            }
        };
        log::debug!("Render target '{}' depth resized to {width}x{height}", self.label);
        self.depth = Some(DepthBuffer {
            texture,
            view,
            width,
            height,
        });
        Ok(())
    }

    /// Retarget color output to one face (or the 2D layer) and mip of `texture`
    pub fn attach_color(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        texture: &mut Texture,
        face: Option<CubeFace>,
        mip: u32,
    ) -> ResourceResult<()> {
        let layer = texture.layer_for(face)?;
        let view = texture.layer_view(backend, face, mip)?;
        let (width, height) = texture.mip_size(mip);
        texture.note_written(layer, mip);

        self.color = Some(ColorSlot {
            view,
            format: texture.format(),
            width,
            height,
            texture_label: texture.label().to_string(),
            face,
            mip,
        });
        self.check_complete()
    }

    pub fn detach_color(&mut self) {
        self.color = None;
    }

    /// Fails unless a color attachment exists and the depth buffer matches its size
    pub fn check_complete(&self) -> ResourceResult<()> {
        let color = self
            .color
            .as_ref()
            .ok_or_else(|| ResourceError::NoColorAttachment(self.label.clone()))?;
        if self.depth_format.is_none() {
            return Ok(());
        }
        let depth = self.depth.as_ref().map_or((0, 0), |d| (d.width, d.height));
        if depth != (color.width, color.height) {
            return Err(ResourceError::IncompleteTarget {
                label: self.label.clone(),
                color: (color.width, color.height),
                depth,
            });
        }
        Ok(())
    }

    /// Open a render pass on the current attachments, clearing color when `clear` is set
    pub fn begin_pass(
        &self,
        backend: &mut dyn GraphicsBackend,
        pass_label: &str,
        clear: Option<[f32; 4]>,
    ) -> ResourceResult<(u32, u32)> {
        self.check_complete()?;
        let Some(color) = self.color.as_ref() else {
            return Err(ResourceError::NoColorAttachment(self.label.clone()));
        };

        let label = match color.face {
            Some(face) => format!("{pass_label} {} {face} mip {}", color.texture_label, color.mip),
            None => format!("{pass_label} {} mip {}", color.texture_label, color.mip),
        };
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(label),
            color_attachments: vec![ColorAttachment {
                view: color.view,
                load_op: clear.map_or(LoadOp::Load, LoadOp::Clear),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: self.depth.as_ref().map(|d| DepthStencilAttachment {
                view: d.view,
                depth_load_op: LoadOp::Clear([1.0; 4]),
                depth_store_op: StoreOp::Discard,
                depth_clear_value: 1.0,
            }),
        });
        Ok((color.width, color.height))
    }

    pub fn end_pass(&self, backend: &mut dyn GraphicsBackend) {
        backend.end_render_pass();
    }

    /// Extent of the current color attachment
    pub fn size(&self) -> Option<(u32, u32)> {
        self.color.as_ref().map(|c| (c.width, c.height))
    }

    pub fn depth_size(&self) -> Option<(u32, u32)> {
        self.depth.as_ref().map(|d| (d.width, d.height))
    }

    pub fn color_format(&self) -> Option<TextureFormat> {
        self.color.as_ref().map(|c| c.format)
    }

    pub fn depth_format(&self) -> Option<TextureFormat> {
        self.depth_format
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn release_depth(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(depth) = self.depth.take() {
            backend.destroy_texture_view(depth.view);
            backend.destroy_texture(depth.texture);
        }
    }

    /// Release the depth buffer and forget the color attachment. Safe to call repeatedly.
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        self.release_depth(backend);
        self.color = None;
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        if self.depth.is_some() {
            log::warn!("Render target '{}' dropped without destroy()", self.label);
        }
    }
}
