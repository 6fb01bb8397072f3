//! GPU mirrors of parsed models and the name-keyed cache that deduplicates
//! them.
//!
//! A `DrawObject` owns the vertex/index buffers for one model at one LOD
//! plus its resolved materials and a fixed-size bone buffer. Scene code
//! holds `DrawObjectInstance`s, lightweight (name, transform, shared
//! pointer) triples; several instances of the same asset share one cached
//! `DrawObject`, so repeated assets upload once.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;
use glam::Mat4;
use parking_lot::Mutex;

use crate::device::{Buffer, Device, Texture};
use crate::error::RenderResult;
use crate::model::{ensure_materials, MaterialData, ModelData, SkeletonData, TextureSlot, VertexElement};
use crate::shader::{MaterialKind, ShaderPackage};

/// Joint slots in a bone buffer. Shaders index a fixed-size array.
pub const MAX_BONES: usize = 128;
/// Slot count used by the legacy shader set.
pub const MAX_BONES_LEGACY: usize = 64;

/// Joint slots a draw object allocates. The legacy renderer's fixed shaders
/// declare the 64-entry array; game-shader packages get the full 128
/// whether or not the object is skinned.
pub fn bone_slot_count(legacy_renderer: bool) -> usize {
    if legacy_renderer {
        MAX_BONES_LEGACY
    } else {
        MAX_BONES
    }
}

/// Floats per bone: a 3x4 row-major transform.
const BONE_FLOATS: usize = 12;

/// GPU buffers for one mesh part: one vertex buffer per declared stream and
/// one index buffer, sized exactly to the part's counts.
pub struct RenderPart {
    pub vertex_buffers: Vec<Buffer>,
    pub index_buffer: Buffer,
    pub index_count: u32,
    pub material_index: u16,
    pub elements: Vec<VertexElement>,
    pub stream_strides: Vec<u32>,
}

impl RenderPart {
    pub fn destroy(&mut self, device: &Device) {
        for buffer in &mut self.vertex_buffers {
            buffer.destroy(device);
        }
        self.index_buffer.destroy(device);
    }
}

/// GPU-side material: parsed shader package, uploaded textures by slot, and
/// an optional constant buffer.
pub struct RenderMaterial {
    pub name: String,
    pub kind: MaterialKind,
    pub package: Option<Arc<ShaderPackage>>,
    pub material_keys: Vec<(u32, u32)>,
    pub textures: HashMap<TextureSlot, Texture>,
    pub constants: Option<Buffer>,
    /// Variant constant block the composite pass binds instead of
    /// `constants`; absent when the material declares none.
    pub transparency_constants: Option<Buffer>,
    /// Structural identity, used both for material deduplication and as
    /// part of the descriptor-set context value.
    pub structural_hash: u64,
}

impl RenderMaterial {
    pub fn from_data(device: &Device, data: &MaterialData) -> RenderResult<RenderMaterial> {
        let mut textures = HashMap::new();
        for (slot, path, pixels) in &data.textures {
            if pixels.data.is_empty() {
                log::warn!("material '{}' slot {:?} has no pixels ({path})", data.name, slot);
                continue;
            }
            let texture = device.upload_texture(
                pixels.width,
                pixels.height,
                vk::Format::R8G8B8A8_UNORM,
                &pixels.data,
                path,
            )?;
            textures.insert(*slot, texture);
        }
        let upload_block = |bytes: &[u8]| -> RenderResult<Option<Buffer>> {
            if bytes.is_empty() {
                return Ok(None);
            }
            let mut buffer = device.create_buffer(
                bytes.len() as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                &data.name,
            )?;
            buffer.write(0, bytes);
            buffer.flush(device)?;
            Ok(Some(buffer))
        };
        let constants = upload_block(&data.constants)?;
        let transparency_constants = upload_block(&data.transparency_constants)?;
        if data.shader_package.is_none() {
            log::warn!("material '{}' has no shader package, its parts will be skipped", data.name);
        }
        Ok(RenderMaterial {
            name: data.name.clone(),
            kind: data.kind,
            package: data.shader_package.clone(),
            material_keys: data.material_keys.clone(),
            textures,
            constants,
            transparency_constants,
            structural_hash: structural_hash(data),
        })
    }

    pub fn destroy(&mut self, device: &Device) {
        for (_, texture) in self.textures.iter_mut() {
            texture.destroy(device);
        }
        if let Some(buffer) = &mut self.constants {
            buffer.destroy(device);
        }
        if let Some(buffer) = &mut self.transparency_constants {
            buffer.destroy(device);
        }
    }
}

/// Hash of a material's structure: name, kind, routing keys, texture slots
/// and paths, constant block. Two materials with the same structure share
/// one GPU upload.
pub fn structural_hash(data: &MaterialData) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.name.hash(&mut hasher);
    (data.kind == MaterialKind::Skin).hash(&mut hasher);
    data.material_keys.hash(&mut hasher);
    for (slot, path, _) in &data.textures {
        slot.hash(&mut hasher);
        path.hash(&mut hasher);
    }
    data.constants.hash(&mut hasher);
    data.transparency_constants.hash(&mut hasher);
    hasher.finish()
}

/// Materials deduplicated by structural hash, shared across draw objects.
#[derive(Default)]
pub struct MaterialCache {
    materials: HashMap<u64, Arc<Mutex<RenderMaterial>>>,
}

impl MaterialCache {
    pub fn get_or_upload(
        &mut self,
        device: &Device,
        data: &MaterialData,
    ) -> RenderResult<Arc<Mutex<RenderMaterial>>> {
        let key = structural_hash(data);
        if let Some(existing) = self.materials.get(&key) {
            return Ok(existing.clone());
        }
        let material = Arc::new(Mutex::new(RenderMaterial::from_data(device, data)?));
        self.materials.insert(key, material.clone());
        Ok(material)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn destroy(&mut self, device: &Device) {
        for (_, material) in self.materials.drain() {
            material.lock().destroy(device);
        }
    }
}

/// One loaded model at one LOD, mirrored on the GPU.
pub struct DrawObject {
    pub name: String,
    pub model: ModelData,
    pub lod: usize,
    pub skinned: bool,
    pub parts: Vec<RenderPart>,
    pub materials: Vec<Arc<Mutex<RenderMaterial>>>,
    pub bone_buffer: Buffer,
    pub bone_matrices: Vec<Mat4>,
    pub from_body: u16,
    pub to_body: u16,
}

/// Parts index materials by a possibly stale index; out-of-range falls back
/// to slot 0, which always exists.
pub fn resolve_material_index(index: u16, material_count: usize) -> usize {
    if (index as usize) < material_count {
        index as usize
    } else {
        0
    }
}

fn upload_parts(device: &Device, model: &ModelData, lod: usize) -> RenderResult<Vec<RenderPart>> {
    let Some(lod_data) = model.lods.get(lod) else {
        log::warn!("model '{}' has no LOD {lod}", model.name);
        return Ok(Vec::new());
    };
    let mut parts = Vec::with_capacity(lod_data.parts.len());
    for (part_index, part) in lod_data.parts.iter().enumerate() {
        let mut vertex_buffers = Vec::with_capacity(part.streams.len());
        for (stream_index, stream) in part.streams.iter().enumerate() {
            let label = format!("{}:p{part_index}:s{stream_index}", model.name);
            let mut buffer = device.create_buffer(
                stream.len() as u64,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                &label,
            )?;
            buffer.write(0, stream);
            buffer.flush(device)?;
            vertex_buffers.push(buffer);
        }
        let index_bytes = bytemuck::cast_slice(&part.indices);
        let label = format!("{}:p{part_index}:idx", model.name);
        let mut index_buffer = device.create_buffer(
            index_bytes.len() as u64,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &label,
        )?;
        index_buffer.write(0, index_bytes);
        index_buffer.flush(device)?;
        parts.push(RenderPart {
            vertex_buffers,
            index_buffer,
            index_count: part.indices.len() as u32,
            material_index: part.material_index,
            elements: part.elements.clone(),
            stream_strides: part.stream_strides.clone(),
        });
    }
    Ok(parts)
}

impl DrawObject {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Device,
        name: &str,
        mut model: ModelData,
        skinned: bool,
        legacy_renderer: bool,
        lod: usize,
        from_body: u16,
        to_body: u16,
        material_cache: &mut MaterialCache,
    ) -> RenderResult<DrawObject> {
        ensure_materials(&mut model.materials);
        let parts = upload_parts(device, &model, lod)?;
        let mut materials = Vec::with_capacity(model.materials.len());
        for material in &model.materials {
            materials.push(material_cache.get_or_upload(device, material)?);
        }
        let bone_slots = bone_slot_count(legacy_renderer);
        let bone_buffer = device.create_buffer(
            (bone_slots * BONE_FLOATS * std::mem::size_of::<f32>()) as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            &format!("{name}:bones"),
        )?;
        Ok(DrawObject {
            name: name.to_string(),
            model,
            lod,
            skinned,
            parts,
            materials,
            bone_buffer,
            bone_matrices: vec![Mat4::IDENTITY; bone_slots],
            from_body,
            to_body,
        })
    }

    /// Rebuild the part buffers from the retained CPU model data, typically
    /// after a LOD change. The previous buffers are destroyed first; the
    /// caller must ensure the GPU is idle or no longer referencing them.
    pub fn reload(&mut self, device: &Device, lod: usize) -> RenderResult<()> {
        for part in &mut self.parts {
            part.destroy(device);
        }
        self.lod = lod;
        self.parts = upload_parts(device, &self.model, lod)?;
        Ok(())
    }

    /// Rewrite the whole bone buffer from the current matrices, transposed
    /// to the 3x4 row-major layout the shaders expect, then flush the
    /// mapped range explicitly.
    pub fn upload_bones(&mut self, device: &Device) -> RenderResult<()> {
        let mut floats = Vec::with_capacity(self.bone_matrices.len() * BONE_FLOATS);
        for matrix in &self.bone_matrices {
            for row in 0..3 {
                let r = matrix.row(row);
                floats.extend_from_slice(&[r.x, r.y, r.z, r.w]);
            }
        }
        self.bone_buffer.write(0, bytemuck::cast_slice(&floats));
        self.bone_buffer.flush(device)
    }

    /// Free the buffers this object owns. Materials live in the shared
    /// [`MaterialCache`] and are destroyed there.
    pub fn destroy(&mut self, device: &Device) {
        for part in &mut self.parts {
            part.destroy(device);
        }
        self.bone_buffer.destroy(device);
    }
}

/// One placed instance of a cached draw object.
pub struct DrawObjectInstance {
    pub name: String,
    pub transform: Mat4,
    pub object: Arc<Mutex<DrawObject>>,
}

/// Name-keyed cache of uploaded draw objects. The cache is the single owner;
/// instances hold shared pointers into it.
#[derive(Default)]
pub struct DrawObjectCache {
    objects: HashMap<String, Arc<Mutex<DrawObject>>>,
}

impl DrawObjectCache {
    /// Fetch the object for `name`, building and uploading it only when
    /// absent. Adding the same asset name twice uploads once.
    pub fn get_or_insert_with(
        &mut self,
        name: &str,
        build: impl FnOnce() -> RenderResult<DrawObject>,
    ) -> RenderResult<Arc<Mutex<DrawObject>>> {
        if let Some(existing) = self.objects.get(name) {
            return Ok(existing.clone());
        }
        let object = Arc::new(Mutex::new(build()?));
        self.objects.insert(name.to_string(), object.clone());
        Ok(object)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<Mutex<DrawObject>>> {
        self.objects.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mutex<DrawObject>>> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn destroy(&mut self, device: &Device) {
        for (_, object) in self.objects.drain() {
            object.lock().destroy(device);
        }
    }
}

/// The active scene: instances plus the object cache behind them, and the
/// skeleton driving skinned objects.
#[derive(Default)]
pub struct DrawList {
    pub instances: Vec<DrawObjectInstance>,
    pub cache: DrawObjectCache,
    pub materials: MaterialCache,
    pub skeleton: Option<SkeletonData>,
    /// Set when the legacy renderer is active; sizes new bone buffers.
    pub legacy_renderer: bool,
}

impl DrawList {
    /// Upload (or reuse) the model's GPU mirror and append one instance.
    #[allow(clippy::too_many_arguments)]
    pub fn add_model(
        &mut self,
        device: &Device,
        name: &str,
        model: ModelData,
        skinned: bool,
        transform: Mat4,
        lod: usize,
        from_body: u16,
        to_body: u16,
    ) -> RenderResult<Arc<Mutex<DrawObject>>> {
        let materials = &mut self.materials;
        let legacy = self.legacy_renderer;
        let object = self.cache.get_or_insert_with(name, || {
            DrawObject::new(
                device, name, model, skinned, legacy, lod, from_body, to_body, materials,
            )
        })?;
        self.instances.push(DrawObjectInstance {
            name: name.to_string(),
            transform,
            object: object.clone(),
        });
        Ok(object)
    }

    /// Remove every instance of `name`. When the last instance goes, the
    /// cached object is dropped and its GPU resources destroyed; the cache
    /// of other assets is untouched.
    pub fn remove_model(&mut self, device: &Device, name: &str) {
        self.instances.retain(|instance| instance.name != name);
        if let Some(object) = self.cache.remove(name) {
            object.lock().destroy(device);
        }
    }

    /// Rebuild one cached object's buffers at a new LOD.
    pub fn reload_model(&mut self, device: &Device, name: &str, lod: usize) -> RenderResult<()> {
        if let Some(instance) = self.instances.iter().find(|i| i.name == name) {
            instance.object.lock().reload(device, lod)?;
        }
        Ok(())
    }

    pub fn set_skeleton(&mut self, skeleton: SkeletonData) {
        self.skeleton = Some(skeleton);
    }

    pub fn clear(&mut self, device: &Device) {
        self.instances.clear();
        self.cache.destroy(device);
        self.materials.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LodData, PartData};

    fn placeholder_object(name: &str) -> DrawObject {
        DrawObject {
            name: name.to_string(),
            model: ModelData::default(),
            lod: 0,
            skinned: false,
            parts: Vec::new(),
            materials: Vec::new(),
            bone_buffer: Buffer::default(),
            bone_matrices: vec![Mat4::IDENTITY; MAX_BONES_LEGACY],
            from_body: 0,
            to_body: 0,
        }
    }

    #[test]
    fn bone_capacity_follows_renderer_mode_not_skinning() {
        assert_eq!(bone_slot_count(false), MAX_BONES);
        assert_eq!(bone_slot_count(true), MAX_BONES_LEGACY);
    }

    #[test]
    fn out_of_range_material_index_falls_back_to_zero() {
        assert_eq!(resolve_material_index(2, 3), 2);
        assert_eq!(resolve_material_index(3, 3), 0);
        assert_eq!(resolve_material_index(u16::MAX, 1), 0);
    }

    #[test]
    fn cache_uploads_each_name_once() {
        let mut cache = DrawObjectCache::default();
        let mut builds = 0;
        for _ in 0..2 {
            cache
                .get_or_insert_with("terrain/plate_03", || {
                    builds += 1;
                    Ok(placeholder_object("terrain/plate_03"))
                })
                .unwrap();
        }
        assert_eq!(builds, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn instances_share_one_object_with_independent_transforms() {
        let mut cache = DrawObjectCache::default();
        let object = cache
            .get_or_insert_with("plate", || Ok(placeholder_object("plate")))
            .unwrap();
        let a = DrawObjectInstance {
            name: "plate".into(),
            transform: Mat4::IDENTITY,
            object: object.clone(),
        };
        let b = DrawObjectInstance {
            name: "plate".into(),
            transform: Mat4::from_translation(glam::Vec3::new(10.0, 0.0, 0.0)),
            object: object.clone(),
        };
        assert!(Arc::ptr_eq(&a.object, &b.object));
        assert_ne!(a.transform, b.transform);
    }

    #[test]
    fn structural_hash_tracks_material_identity() {
        let base = MaterialData {
            name: "iron".into(),
            material_keys: vec![(1, 2)],
            ..MaterialData::default()
        };
        let same = base.clone();
        let mut different = base.clone();
        different.material_keys = vec![(1, 3)];
        assert_eq!(structural_hash(&base), structural_hash(&same));
        assert_ne!(structural_hash(&base), structural_hash(&different));
        let mut variant = base.clone();
        variant.transparency_constants = vec![1, 2, 3];
        assert_ne!(structural_hash(&base), structural_hash(&variant));
    }

    #[test]
    fn model_without_materials_gets_a_default_one() {
        let mut model = ModelData {
            name: "cube".into(),
            lods: vec![LodData {
                parts: vec![PartData::default()],
            }],
            materials: Vec::new(),
        };
        ensure_materials(&mut model.materials);
        assert_eq!(model.materials.len(), 1);
        assert_eq!(resolve_material_index(5, model.materials.len()), 0);
    }
}
