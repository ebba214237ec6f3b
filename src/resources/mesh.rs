//! Geometry the probe passes draw: a unit cube for face captures and a full-screen
//! triangle for 2D passes.

use crate::backend::*;
use glam::{Vec2, Vec3, Vec4};

use super::error::ResourceResult;

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Unit cube centered at the origin, positions in [-0.5, 0.5]
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        let positions = [
            // +Z
            (Vec3::new(-0.5, -0.5, 0.5), Vec3::Z, Vec2::new(0.0, 1.0)),
            (Vec3::new(0.5, -0.5, 0.5), Vec3::Z, Vec2::new(1.0, 1.0)),
            (Vec3::new(0.5, 0.5, 0.5), Vec3::Z, Vec2::new(1.0, 0.0)),
            (Vec3::new(-0.5, 0.5, 0.5), Vec3::Z, Vec2::new(0.0, 0.0)),
            // -Z
            (Vec3::new(0.5, -0.5, -0.5), -Vec3::Z, Vec2::new(0.0, 1.0)),
            (Vec3::new(-0.5, -0.5, -0.5), -Vec3::Z, Vec2::new(1.0, 1.0)),
            (Vec3::new(-0.5, 0.5, -0.5), -Vec3::Z, Vec2::new(1.0, 0.0)),
            (Vec3::new(0.5, 0.5, -0.5), -Vec3::Z, Vec2::new(0.0, 0.0)),
            // +X
            (Vec3::new(0.5, -0.5, 0.5), Vec3::X, Vec2::new(0.0, 1.0)),
            (Vec3::new(0.5, -0.5, -0.5), Vec3::X, Vec2::new(1.0, 1.0)),
            (Vec3::new(0.5, 0.5, -0.5), Vec3::X, Vec2::new(1.0, 0.0)),
            (Vec3::new(0.5, 0.5, 0.5), Vec3::X, Vec2::new(0.0, 0.0)),
            // -X
            (Vec3::new(-0.5, -0.5, -0.5), -Vec3::X, Vec2::new(0.0, 1.0)),
            (Vec3::new(-0.5, -0.5, 0.5), -Vec3::X, Vec2::new(1.0, 1.0)),
            (Vec3::new(-0.5, 0.5, 0.5), -Vec3::X, Vec2::new(1.0, 0.0)),
            (Vec3::new(-0.5, 0.5, -0.5), -Vec3::X, Vec2::new(0.0, 0.0)),
            // +Y
            (Vec3::new(-0.5, 0.5, 0.5), Vec3::Y, Vec2::new(0.0, 1.0)),
            (Vec3::new(0.5, 0.5, 0.5), Vec3::Y, Vec2::new(1.0, 1.0)),
            (Vec3::new(0.5, 0.5, -0.5), Vec3::Y, Vec2::new(1.0, 0.0)),
            (Vec3::new(-0.5, 0.5, -0.5), Vec3::Y, Vec2::new(0.0, 0.0)),
            // -Y
            (Vec3::new(-0.5, -0.5, -0.5), -Vec3::Y, Vec2::new(0.0, 1.0)),
            (Vec3::new(0.5, -0.5, -0.5), -Vec3::Y, Vec2::new(1.0, 1.0)),
            (Vec3::new(0.5, -0.5, 0.5), -Vec3::Y, Vec2::new(1.0, 0.0)),
            (Vec3::new(-0.5, -0.5, 0.5), -Vec3::Y, Vec2::new(0.0, 0.0)),
        ];

        for (position, normal, uv) in positions {
            let tangent = if normal.abs().y > 0.9 {
                Vec4::new(1.0, 0.0, 0.0, 1.0)
            } else {
                Vec3::Y.cross(normal).normalize().extend(1.0)
            };

            mesh.vertices.push(Vertex {
                position,
                normal,
                uv,
                tangent,
            });
        }

        for face in 0..6 {
            let base = face * 4;
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }
}

/// Mesh uploaded to vertex and index buffers
pub struct GpuMesh {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    index_count: u32,
}

impl GpuMesh {
    pub fn create(backend: &mut dyn GraphicsBackend, mesh: &Mesh) -> ResourceResult<Self> {
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} vertices", mesh.name)),
                size: mesh.vertex_bytes().len() as u64,
                usage: BufferUsage::VERTEX,
                mapped_at_creation: false,
            },
            mesh.vertex_bytes(),
        )?;
        let index_buffer = match backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} indices", mesh.name)),
                size: mesh.index_bytes().len() as u64,
                usage: BufferUsage::INDEX,
                mapped_at_creation: false,
            },
            mesh.index_bytes(),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                backend.destroy_buffer(vertex_buffer);
                return Err(err.into());
            }
        };

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: mesh.index_count() as u32,
        })
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    fn render(&self, backend: &mut dyn GraphicsBackend) {
        backend.set_vertex_buffer(0, self.vertex_buffer, 0);
        backend.set_index_buffer(self.index_buffer, 0, IndexFormat::Uint32);
        backend.draw_indexed(0..self.index_count, 0, 0..1);
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.vertex_buffer);
        backend.destroy_buffer(self.index_buffer);
    }
}

/// Geometry a raster pass draws
pub enum DrawPrimitive {
    /// Unit cube seen from its center, one draw per captured face
    Cube(GpuMesh),
    /// Single triangle covering the viewport, generated from the vertex index
    FullscreenTriangle,
}

impl DrawPrimitive {
    pub fn cube(backend: &mut dyn GraphicsBackend) -> ResourceResult<Self> {
        Ok(Self::Cube(GpuMesh::create(backend, &Mesh::cube())?))
    }

    pub fn fullscreen_triangle() -> Self {
        Self::FullscreenTriangle
    }

    /// Vertex buffer layouts a pipeline drawing this primitive must declare
    pub fn vertex_layouts(&self) -> Vec<VertexBufferLayout> {
        match self {
            Self::Cube(_) => vec![Vertex::layout()],
            Self::FullscreenTriangle => Vec::new(),
        }
    }

    /// Record the draw inside an open render pass
    pub fn render(&self, backend: &mut dyn GraphicsBackend) {
        match self {
            Self::Cube(mesh) => mesh.render(backend),
            Self::FullscreenTriangle => backend.draw(0..3, 0..1),
        }
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        if let Self::Cube(mesh) = self {
            mesh.destroy(backend);
        }
    }
}
