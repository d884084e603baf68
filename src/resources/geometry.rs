//! Geometry: interleaved vertex arrays, instance streams and built-in shapes

use std::collections::HashMap;
use std::f32::consts::PI;

use glam::{Vec2, Vec3, Vec4};
use slotmap::{new_key_type, SlotMap};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::math::WORLD_UP;

new_key_type! {
    /// Id of a geometry owned by a [`GeometryStore`]
    pub struct GeometryId;
}

/// Vertex count per side of the ocean grid
pub const GRID_VERTEX_COUNT: u32 = 200;

/// First vertex location of per-instance streams
pub const INSTANCE_LOCATION: u32 = 5;

/// Axis-aligned bounds with a bounding-sphere radius
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
    pub center: Vec3,
    pub radius: f32,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            min: Vec3::splat(-1.0),
            max: Vec3::splat(1.0),
            center: Vec3::ZERO,
            radius: 3.0f32.sqrt(),
        }
    }
}

impl BoundingBox {
    pub fn from_points(points: &[Vec3]) -> Self {
        if points.is_empty() {
            return Self::default();
        }
        let (min, max) = points.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(min, max), p| (min.min(*p), max.max(*p)),
        );
        let center = (min + max) * 0.5;
        Self {
            min,
            max,
            center,
            radius: (max - center).length(),
        }
    }
}

/// CPU-side geometry before upload
#[derive(Debug, Clone, Default)]
pub struct GeometryData {
    pub name: String,
    pub positions: Vec<Vec3>,
    pub colors: Vec<Vec4>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec3>,
    pub tex_coords: Vec<Vec2>,
    pub indices: Vec<u32>,
    pub bone_indices: Vec<Vec4>,
    pub bone_weights: Vec<Vec4>,
}

impl GeometryData {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_skeletal(&self) -> bool {
        !self.bone_indices.is_empty() && !self.bone_weights.is_empty()
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::from_points(&self.positions)
    }

    /// Fill absent attributes: colors default to ones, normals to (1, 1, 1),
    /// texcoords to zero and tangents are derived.
    pub fn fill_defaults(&mut self) {
        let count = self.positions.len();
        if self.colors.len() != count {
            self.colors = vec![Vec4::ONE; count];
        }
        if self.normals.len() != count {
            self.normals = vec![Vec3::ONE; count];
        }
        if self.tex_coords.len() != count {
            self.tex_coords = vec![Vec2::ZERO; count];
        }
        if self.tangents.len() != count {
            self.tangents = compute_tangents(&self.positions, &self.normals, &self.tex_coords, &self.indices);
        }
    }

    /// Interleaved vertex data and its layout.
    pub fn interleave(&self) -> (Vec<f32>, VertexLayout) {
        let skeletal = self.is_skeletal();
        let mut components: Vec<usize> = vec![3, 4, 3, 3, 2];
        if skeletal {
            components.extend([4, 4]);
        }
        let mut attributes = Vec::with_capacity(components.len());
        let mut offset = 0;
        for (location, size) in components.iter().enumerate() {
            attributes.push(VertexAttribute {
                location: location as u32,
                format: VertexFormat::from_components(*size).unwrap_or(VertexFormat::Float32x4),
                offset,
            });
            offset += *size as u64 * 4;
        }
        let floats_per_vertex = components.iter().sum::<usize>();
        let mut data = Vec::with_capacity(self.positions.len() * floats_per_vertex);
        for i in 0..self.positions.len() {
            data.extend_from_slice(&self.positions[i].to_array());
            data.extend_from_slice(&self.colors.get(i).copied().unwrap_or(Vec4::ONE).to_array());
            data.extend_from_slice(&self.normals.get(i).copied().unwrap_or(Vec3::ONE).to_array());
            data.extend_from_slice(&self.tangents.get(i).copied().unwrap_or(Vec3::X).to_array());
            data.extend_from_slice(&self.tex_coords.get(i).copied().unwrap_or(Vec2::ZERO).to_array());
            if skeletal {
                data.extend_from_slice(&self.bone_indices.get(i).copied().unwrap_or(Vec4::ZERO).to_array());
                data.extend_from_slice(&self.bone_weights.get(i).copied().unwrap_or(Vec4::ZERO).to_array());
            }
        }
        (
            data,
            VertexLayout {
                stride: offset,
                attributes,
            },
        )
    }

    /// Fullscreen quad in clip space.
    pub fn quad() -> Self {
        let mut data = Self::new("quad");
        data.positions = vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ];
        data.normals = vec![Vec3::Z; 4];
        data.tex_coords = vec![
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 0.0),
        ];
        data.indices = vec![0, 1, 2, 0, 2, 3];
        data.fill_defaults();
        data
    }

    /// Unit cube centered at the origin.
    pub fn cube() -> Self {
        let mut data = Self::new("cube");
        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];
        for (normal, right) in faces {
            let up = normal.cross(right);
            let base = data.positions.len() as u32;
            for (u, v) in [(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
                let position = normal * 0.5 + right * (u - 0.5) + up * (0.5 - v);
                data.positions.push(position);
                data.normals.push(normal);
                data.tex_coords.push(Vec2::new(u, v));
            }
            data.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        data.fill_defaults();
        data
    }

    /// UV sphere of radius 1.
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut data = Self::new("sphere");
        let segments = segments.max(3);
        let rings = rings.max(2);
        for ring in 0..=rings {
            let phi = ring as f32 * PI / rings as f32;
            let (y, ring_radius) = (phi.cos(), phi.sin());
            for segment in 0..=segments {
                let theta = segment as f32 * 2.0 * PI / segments as f32;
                let normal = Vec3::new(ring_radius * theta.cos(), y, ring_radius * theta.sin());
                data.positions.push(normal);
                data.normals.push(normal.normalize_or_zero());
                data.tex_coords.push(Vec2::new(
                    segment as f32 / segments as f32,
                    ring as f32 / rings as f32,
                ));
            }
        }
        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                data.indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }
        data.fill_defaults();
        data
    }

    /// Flat grid of `count` x `count` vertices spanning [-0.5, 0.5] on XZ.
    pub fn grid(count: u32) -> Self {
        let mut data = Self::new("grid");
        let count = count.max(2);
        let step = 1.0 / (count - 1) as f32;
        for z in 0..count {
            for x in 0..count {
                data.positions
                    .push(Vec3::new(x as f32 * step - 0.5, 0.0, z as f32 * step - 0.5));
                data.normals.push(Vec3::Y);
                data.tex_coords.push(Vec2::new(x as f32 * step, z as f32 * step));
            }
        }
        for z in 0..count - 1 {
            for x in 0..count - 1 {
                let current = z * count + x;
                let next = current + count;
                data.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }
        data.fill_defaults();
        data
    }
}

/// Per-vertex tangents from the UV parameterisation.
///
/// Triangles whose UV determinant is zero, or whose tangent vanishes,
/// contribute `cross(average normal, up)` instead.
pub fn compute_tangents(positions: &[Vec3], normals: &[Vec3], tex_coords: &[Vec2], indices: &[u32]) -> Vec<Vec3> {
    let mut tangents = vec![Vec3::ZERO; positions.len()];
    let normal_at = |i: usize| normals.get(i).copied().unwrap_or(Vec3::ONE);
    let uv_at = |i: usize| tex_coords.get(i).copied().unwrap_or(Vec2::ZERO);
    for triangle in indices.chunks_exact(3) {
        let [i0, i1, i2] = [triangle[0] as usize, triangle[1] as usize, triangle[2] as usize];
        if i0 >= positions.len() || i1 >= positions.len() || i2 >= positions.len() {
            continue;
        }
        let edge1 = positions[i1] - positions[i0];
        let edge2 = positions[i2] - positions[i0];
        let duv1 = uv_at(i1) - uv_at(i0);
        let duv2 = uv_at(i2) - uv_at(i0);
        let denominator = duv1.x * duv2.y - duv2.x * duv1.y;
        let mut tangent = if denominator != 0.0 {
            (edge1 * duv2.y - edge2 * duv1.y) / denominator
        } else {
            Vec3::ZERO
        };
        if tangent.length_squared() == 0.0 {
            let average = (normal_at(i0) + normal_at(i1) + normal_at(i2)) / 3.0;
            tangent = fallback_tangent(average);
        }
        for i in [i0, i1, i2] {
            tangents[i] += tangent;
        }
    }
    tangents
        .iter()
        .enumerate()
        .map(|(i, tangent)| {
            let normal = normal_at(i).normalize_or_zero();
            let orthogonal = *tangent - normal * normal.dot(*tangent);
            if orthogonal.length_squared() > 1e-12 {
                orthogonal.normalize()
            } else {
                fallback_tangent(normal)
            }
        })
        .collect()
}

fn fallback_tangent(normal: Vec3) -> Vec3 {
    let tangent = normal.cross(WORLD_UP);
    if tangent.length_squared() > 1e-12 {
        tangent.normalize()
    } else {
        Vec3::X
    }
}

/// Interleaved vertex buffer, element buffer and the vertex array binding them
#[derive(Debug, Clone)]
pub struct VertexArrayBuffer {
    vertex_array: VertexArrayHandle,
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    index_count: u32,
    layout: VertexLayout,
}

impl VertexArrayBuffer {
    pub fn create(backend: &mut dyn GraphicsBackend, data: &GeometryData) -> RenderResult<Self> {
        let (vertices, layout) = data.interleave();
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&data.indices);
        let vertex_buffer = backend.create_buffer(&BufferDescriptor {
            label: format!("{}_vertices", data.name),
            kind: BufferKind::Vertex,
            size: vertex_bytes.len().max(4) as u64,
        })?;
        backend.write_buffer(vertex_buffer, 0, vertex_bytes)?;
        let index_buffer = backend.create_buffer(&BufferDescriptor {
            label: format!("{}_indices", data.name),
            kind: BufferKind::Index,
            size: index_bytes.len().max(4) as u64,
        })?;
        backend.write_buffer(index_buffer, 0, index_bytes)?;
        let vertex_array = backend.create_vertex_array(&VertexArrayDescriptor {
            label: data.name.clone(),
            vertex_buffer,
            layout: layout.clone(),
            index_buffer,
            index_count: data.indices.len() as u32,
        })?;
        Ok(Self {
            vertex_array,
            vertex_buffer,
            index_buffer,
            index_count: data.indices.len() as u32,
            layout,
        })
    }

    pub fn handle(&self) -> VertexArrayHandle {
        self.vertex_array
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn layout(&self) -> &VertexLayout {
        &self.layout
    }

    pub fn bind_vertex_buffer(&self, backend: &mut dyn GraphicsBackend) {
        backend.bind_vertex_array(self.vertex_array);
    }

    pub fn draw_elements(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        backend.draw_elements(PrimitiveMode::Triangles, self.index_count, 1)?;
        Ok(())
    }

    /// Instanced draw using the instance buffer's current contents.
    pub fn draw_elements_instanced(
        &self,
        backend: &mut dyn GraphicsBackend,
        instance_count: u32,
        instance_buffer: Option<&InstanceBuffer>,
    ) -> RenderResult<()> {
        backend.set_instance_stream(self.vertex_array, instance_buffer.map(InstanceBuffer::stream))?;
        backend.bind_vertex_array(self.vertex_array);
        backend.draw_elements(PrimitiveMode::Triangles, self.index_count, instance_count)?;
        Ok(())
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_vertex_array(self.vertex_array);
        backend.destroy_buffer(self.vertex_buffer);
        backend.destroy_buffer(self.index_buffer);
    }
}

/// Per-instance vertex stream. Every attribute is a multiple of 16 bytes and
/// is split into consecutive `vec4` slots with divisor 1.
#[derive(Debug, Clone)]
pub struct InstanceBuffer {
    name: String,
    buffer: BufferHandle,
    layout: VertexLayout,
    capacity: u32,
}

impl InstanceBuffer {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        name: &str,
        first_location: u32,
        attributes: &[(&str, u64)],
        capacity: u32,
    ) -> RenderResult<Self> {
        let mut slots = Vec::new();
        let mut offset = 0;
        let mut location = first_location;
        for (attribute, size) in attributes {
            if *size == 0 || size % 16 != 0 {
                return Err(RenderError::InstanceLayout {
                    name: attribute.to_string(),
                    size: *size,
                });
            }
            for _ in 0..size / 16 {
                slots.push(VertexAttribute {
                    location,
                    format: VertexFormat::Float32x4,
                    offset,
                });
                location += 1;
                offset += 16;
            }
        }
        let layout = VertexLayout {
            stride: offset,
            attributes: slots,
        };
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: name.to_string(),
            kind: BufferKind::Instance,
            size: layout.stride * capacity.max(1) as u64,
        })?;
        Ok(Self {
            name: name.to_string(),
            buffer,
            layout,
            capacity: capacity.max(1),
        })
    }

    pub fn stride(&self) -> u64 {
        self.layout.stride
    }

    pub fn layout(&self) -> &VertexLayout {
        &self.layout
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn stream(&self) -> InstanceStream {
        InstanceStream {
            buffer: self.buffer,
            layout: self.layout.clone(),
            divisor: 1,
        }
    }

    /// Upload packed instance records, growing the buffer when needed.
    pub fn bind_instance_buffer(&mut self, backend: &mut dyn GraphicsBackend, data: &[u8]) -> RenderResult<()> {
        let count = (data.len() as u64 / self.layout.stride.max(1)) as u32;
        if count > self.capacity {
            backend.destroy_buffer(self.buffer);
            self.capacity = count.next_power_of_two();
            self.buffer = backend.create_buffer(&BufferDescriptor {
                label: self.name.clone(),
                kind: BufferKind::Instance,
                size: self.layout.stride * self.capacity as u64,
            })?;
        }
        backend.write_buffer(self.buffer, 0, data)?;
        Ok(())
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

/// Uploaded geometry with its bounds
#[derive(Debug, Clone)]
pub struct Geometry {
    pub name: String,
    pub vertex_buffer: VertexArrayBuffer,
    pub bounds: BoundingBox,
    pub skeletal: bool,
}

impl Geometry {
    pub fn create(backend: &mut dyn GraphicsBackend, data: &GeometryData) -> RenderResult<Self> {
        let mut data = data.clone();
        data.fill_defaults();
        let vertex_buffer = VertexArrayBuffer::create(backend, &data)?;
        log::debug!(
            "Created geometry {} ({} vertices, {} indices)",
            data.name,
            data.vertex_count(),
            data.indices.len()
        );
        Ok(Self {
            name: data.name.clone(),
            vertex_buffer,
            bounds: data.bounds(),
            skeletal: data.is_skeletal(),
        })
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        self.vertex_buffer.destroy(backend);
    }
}

/// Arena of named geometries
#[derive(Default)]
pub struct GeometryStore {
    geometries: SlotMap<GeometryId, Geometry>,
    names: HashMap<String, GeometryId>,
}

impl GeometryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload the quad, cube, sphere and ocean grid.
    pub fn create_builtin(&mut self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        for data in [
            GeometryData::quad(),
            GeometryData::cube(),
            GeometryData::sphere(32, 16),
            GeometryData::grid(GRID_VERTEX_COUNT),
        ] {
            self.create(backend, &data)?;
        }
        Ok(())
    }

    /// Upload and store under the data's name, replacing a previous holder.
    pub fn create(&mut self, backend: &mut dyn GraphicsBackend, data: &GeometryData) -> RenderResult<GeometryId> {
        let geometry = Geometry::create(backend, data)?;
        if let Some(old) = self.names.remove(&geometry.name).and_then(|id| self.geometries.remove(id)) {
            old.destroy(backend);
        }
        let name = geometry.name.clone();
        let id = self.geometries.insert(geometry);
        self.names.insert(name, id);
        Ok(id)
    }

    pub fn get(&self, id: GeometryId) -> Option<&Geometry> {
        self.geometries.get(id)
    }

    pub fn id_of(&self, name: &str) -> Option<GeometryId> {
        self.names.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&Geometry> {
        self.id_of(name).and_then(|id| self.geometries.get(id))
    }

    pub fn remove(&mut self, backend: &mut dyn GraphicsBackend, name: &str) -> bool {
        match self.names.remove(name).and_then(|id| self.geometries.remove(id)) {
            Some(geometry) => {
                geometry.destroy(backend);
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    #[test]
    fn test_tangents_are_normalized_and_not_parallel() {
        let sphere = GeometryData::sphere(12, 8);
        assert_eq!(sphere.tangents.len(), sphere.positions.len());
        for (tangent, normal) in sphere.tangents.iter().zip(&sphere.normals) {
            assert!((tangent.length() - 1.0).abs() < 1e-4);
            if normal.length_squared() > 0.5 {
                assert!(tangent.dot(*normal).abs() < 1.0 - 1e-3);
            }
        }
    }

    #[test]
    fn test_degenerate_uv_uses_up_fallback() {
        let positions = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let normals = [Vec3::Z; 3];
        let uvs = [Vec2::splat(0.5); 3];
        let tangents = compute_tangents(&positions, &normals, &uvs, &[0, 1, 2]);
        let expected = Vec3::Z.cross(WORLD_UP).normalize();
        for tangent in tangents {
            assert!(tangent.abs_diff_eq(expected, 1e-6), "{tangent:?}");
        }
    }

    #[test]
    fn test_tangent_follows_u_direction() {
        let quad = GeometryData::quad();
        for tangent in &quad.tangents {
            assert!(tangent.abs_diff_eq(Vec3::X, 1e-5), "{tangent:?}");
        }
    }

    #[test]
    fn test_interleaved_layout() {
        let mut data = GeometryData::cube();
        let (vertices, layout) = data.interleave();
        assert_eq!(layout.stride, 60);
        assert_eq!(vertices.len(), 24 * 15);
        data.bone_indices = vec![Vec4::ZERO; 24];
        data.bone_weights = vec![Vec4::X; 24];
        let (_, skinned) = data.interleave();
        assert_eq!(skinned.stride, 92);
        assert_eq!(skinned.attributes[6].location, 6);
    }

    #[test]
    fn test_missing_attributes_get_defaults() {
        let mut data = GeometryData::new("tri");
        data.positions = vec![Vec3::ZERO, Vec3::X, Vec3::Y];
        data.indices = vec![0, 1, 2];
        data.fill_defaults();
        assert_eq!(data.colors, vec![Vec4::ONE; 3]);
        assert_eq!(data.normals, vec![Vec3::ONE; 3]);
        assert_eq!(data.tangents.len(), 3);
    }

    #[test]
    fn test_instance_layout_rule() {
        let mut backend = DummyBackend::new(4, 4);
        let buffer = InstanceBuffer::new(
            &mut backend,
            "particles",
            INSTANCE_LOCATION,
            &[("parent_matrix", 64), ("uv", 16)],
            8,
        )
        .unwrap();
        assert_eq!(buffer.stride(), 80);
        let locations: Vec<u32> = buffer.layout().attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![5, 6, 7, 8, 9]);
        let error = InstanceBuffer::new(&mut backend, "bad", 5, &[("opacity", 4)], 8).unwrap_err();
        assert!(matches!(error, RenderError::InstanceLayout { size: 4, .. }));
        assert!(error.is_fatal());
    }

    #[test]
    fn test_sphere_bounds() {
        let sphere = GeometryData::sphere(16, 8);
        let bounds = sphere.bounds();
        assert!(bounds.center.length() < 1e-5);
        assert!((bounds.max.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_store_uploads_builtin_shapes() {
        let mut backend = DummyBackend::new(4, 4);
        let mut store = GeometryStore::new();
        store.create_builtin(&mut backend).unwrap();
        assert_eq!(store.names(), vec!["cube", "grid", "quad", "sphere"]);
        let grid = store.by_name("grid").unwrap();
        assert_eq!(
            grid.vertex_buffer.index_count(),
            (GRID_VERTEX_COUNT - 1).pow(2) * 6
        );
    }
}
