//! Drawables: the scene-side records cameras render.
//!
//! The scene owns its drawables in a [`DrawableTable`]. Cameras keep only a
//! [`DrawableId`] per registered drawable, so removing one from the table
//! invalidates the camera's record instead of leaving it dangling.

use std::sync::Arc;

use glam::Mat4;
use kiln_core::{Arena, Handle};
use kiln_resources::MeshData;
use kiln_rhi::RhiResult;
use kiln_rhi::backend::GpuBackend;
use kiln_rhi::command::IndexType;
use kiln_rhi::resource::{BufferUsage, GpuBuffer};
use kiln_scene::TransformSource;
use tracing::{debug, warn};

use crate::camera::CameraId;
use crate::material::MaterialId;

pub type DrawableId = Handle<Drawable>;

/// Bones a skinned mesh may use.
pub const MAX_BONES: u32 = 64;

/// What a drawable renders as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawableKind {
    Mesh,
    SkinnedMesh { bone_count: u32 },
    Sprite,
}

/// Uploaded vertex and index buffers plus the range to draw.
#[derive(Clone, Debug)]
pub struct Geometry {
    pub vertices: Arc<GpuBuffer>,
    pub indices: Arc<GpuBuffer>,
    pub index_type: IndexType,
    pub index_count: u32,
    pub first_index: u32,
}

impl Geometry {
    pub fn upload(backend: Arc<dyn GpuBackend>, mesh: &MeshData) -> RhiResult<Self> {
        let vertices = GpuBuffer::with_data(backend.clone(), BufferUsage::Vertex, mesh.vertex_bytes())?;
        let indices = GpuBuffer::with_data(backend, BufferUsage::Index, mesh.index_bytes())?;
        debug!(
            "Uploaded mesh '{}': {} vertices, {} indices",
            mesh.label(),
            mesh.vertices().len(),
            mesh.index_count()
        );
        Ok(Self {
            vertices: Arc::new(vertices),
            indices: Arc::new(indices),
            index_type: mesh.indices().index_type(),
            index_count: mesh.index_count(),
            first_index: 0,
        })
    }
}

/// Per-instance data bound next to the vertex buffer.
#[derive(Clone, Debug)]
pub struct InstanceData {
    pub buffer: Arc<GpuBuffer>,
    pub stride: u32,
    pub count: u32,
}

pub struct Drawable {
    kind: DrawableKind,
    geometry: Option<Geometry>,
    material: Option<MaterialId>,
    instances: Option<InstanceData>,
    transform: Box<dyn TransformSource>,
    layer: u32,
    enabled: bool,
    epoch: u64,
    camera: Option<CameraId>,
}

impl Drawable {
    pub fn new(kind: DrawableKind, transform: impl TransformSource + 'static) -> Self {
        Self {
            kind,
            geometry: None,
            material: None,
            instances: None,
            transform: Box::new(transform),
            layer: 0,
            enabled: true,
            epoch: 0,
            camera: None,
        }
    }

    pub fn mesh(geometry: Geometry, transform: impl TransformSource + 'static) -> Self {
        Self::new(DrawableKind::Mesh, transform).with_geometry(geometry)
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.set_geometry(geometry);
        self
    }

    pub fn with_material(mut self, material: MaterialId) -> Self {
        self.set_material(Some(material));
        self
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.set_layer(layer);
        self
    }

    #[inline]
    pub fn kind(&self) -> DrawableKind {
        self.kind
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.geometry.as_ref()
    }

    pub fn set_geometry(&mut self, geometry: Geometry) {
        self.geometry = Some(geometry);
        self.epoch += 1;
    }

    pub fn material(&self) -> Option<MaterialId> {
        self.material
    }

    pub fn set_material(&mut self, material: Option<MaterialId>) {
        if self.material != material {
            self.material = material;
            self.epoch += 1;
        }
    }

    pub fn instances(&self) -> Option<&InstanceData> {
        self.instances.as_ref()
    }

    pub fn set_instances(&mut self, instances: Option<InstanceData>) {
        self.instances = instances;
        self.epoch += 1;
    }

    pub fn world_matrix(&self) -> Mat4 {
        self.transform.world_matrix()
    }

    pub fn set_transform(&mut self, transform: impl TransformSource + 'static) {
        self.transform = Box::new(transform);
    }

    /// Bit index tested against camera culling masks.
    pub fn layer(&self) -> u32 {
        self.layer
    }

    pub fn set_layer(&mut self, layer: u32) {
        if layer >= u32::BITS {
            warn!("Layer {} out of range; using layer 31", layer);
        }
        self.layer = layer.min(u32::BITS - 1);
    }

    #[inline]
    pub fn layer_mask(&self) -> u32 {
        1 << self.layer
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Bumped whenever recorded commands for this drawable go stale.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Camera this drawable is registered with.
    pub fn camera(&self) -> Option<CameraId> {
        self.camera
    }

    pub(crate) fn attached(&mut self, camera: CameraId) {
        self.camera = Some(camera);
    }

    pub(crate) fn detached(&mut self) {
        self.camera = None;
    }

    /// Disable the drawable if it cannot be drawn as configured.
    ///
    /// Returns whether it is still enabled.
    pub fn check(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.geometry.is_none() {
            warn!("{:?} drawable has no geometry; disabled", self.kind);
            self.enabled = false;
        } else if let DrawableKind::SkinnedMesh { bone_count } = self.kind
            && bone_count > MAX_BONES
        {
            warn!(
                "Skinned mesh uses {} bones, limit is {}; disabled",
                bone_count, MAX_BONES
            );
            self.enabled = false;
        } else if let Some(instances) = &self.instances
            && (instances.stride == 0 || instances.count == 0)
        {
            warn!("Instance data with zero stride or count; instancing dropped");
            self.instances = None;
            self.epoch += 1;
        }
        self.enabled
    }
}

impl std::fmt::Debug for Drawable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drawable")
            .field("kind", &self.kind)
            .field("material", &self.material)
            .field("layer", &self.layer)
            .field("enabled", &self.enabled)
            .field("epoch", &self.epoch)
            .field("camera", &self.camera)
            .finish()
    }
}

/// The scene's drawables.
#[derive(Default)]
pub struct DrawableTable {
    drawables: Arena<Drawable>,
}

impl DrawableTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, drawable: Drawable) -> DrawableId {
        self.drawables.insert(drawable)
    }

    /// Remove a drawable. Cameras drop their record for it on their next
    /// update.
    pub fn remove(&mut self, id: DrawableId) -> Option<Drawable> {
        self.drawables.remove(id)
    }

    pub fn get(&self, id: DrawableId) -> Option<&Drawable> {
        self.drawables.get(id)
    }

    pub fn get_mut(&mut self, id: DrawableId) -> Option<&mut Drawable> {
        self.drawables.get_mut(id)
    }

    pub fn contains(&self, id: DrawableId) -> bool {
        self.drawables.contains(id)
    }

    pub fn len(&self) -> usize {
        self.drawables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drawables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DrawableId, &Drawable)> {
        self.drawables.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_rhi::headless::HeadlessBackend;

    fn geometry() -> Geometry {
        let backend = HeadlessBackend::new();
        Geometry::upload(backend, &MeshData::quad(1.0)).unwrap()
    }

    #[test]
    fn test_upload_quad() {
        let geometry = geometry();
        assert_eq!(geometry.index_count, 6);
        assert_eq!(geometry.index_type, IndexType::U16);
        assert_eq!(geometry.indices.size(), 12);
    }

    #[test]
    fn test_missing_geometry_disables() {
        let mut drawable = Drawable::new(DrawableKind::Sprite, Mat4::IDENTITY);
        assert!(!drawable.check());
        assert!(!drawable.is_enabled());
    }

    #[test]
    fn test_bone_limit_disables() {
        let mut drawable = Drawable::new(
            DrawableKind::SkinnedMesh { bone_count: MAX_BONES + 1 },
            Mat4::IDENTITY,
        )
        .with_geometry(geometry());
        assert!(!drawable.check());

        let mut within = Drawable::new(
            DrawableKind::SkinnedMesh { bone_count: MAX_BONES },
            Mat4::IDENTITY,
        )
        .with_geometry(geometry());
        assert!(within.check());
    }

    #[test]
    fn test_epoch_tracks_changes() {
        let mut drawable = Drawable::mesh(geometry(), Mat4::IDENTITY);
        let epoch = drawable.epoch();
        drawable.set_material(None);
        assert_eq!(drawable.epoch(), epoch);
        drawable.set_geometry(geometry());
        assert_eq!(drawable.epoch(), epoch + 1);
        drawable.set_enabled(false);
        assert_eq!(drawable.epoch(), epoch + 1);
    }

    #[test]
    fn test_layer_is_clamped() {
        let drawable = Drawable::mesh(geometry(), Mat4::IDENTITY).with_layer(40);
        assert_eq!(drawable.layer(), 31);
        assert_eq!(drawable.layer_mask(), 1 << 31);
    }

    #[test]
    fn test_table_removal_invalidates_id() {
        let mut table = DrawableTable::new();
        let id = table.insert(Drawable::mesh(geometry(), Mat4::IDENTITY));
        assert!(table.contains(id));
        table.remove(id);
        assert!(table.get(id).is_none());
        let reused = table.insert(Drawable::mesh(geometry(), Mat4::IDENTITY));
        assert_ne!(id, reused);
    }
}
