//! Uniform set factories and uniform sets.
//!
//! A factory owns a descriptor set layout, the descriptor pools sets are
//! allocated from, and a free list of sets returned by dropped uniform sets.
//! All of it lives in [`UsfState`] behind the engine's `usf` lock, together
//! with the factory's reference count. The factory handle, every uniform set
//! and every pipeline layout built from it hold one reference; the layout and
//! pools are destroyed when the count reaches zero.

use crate::buffer::{Buffer, UpdateMode};
use crate::deferred::Object;
use crate::device::Device;
use crate::engine::{Core, Engine};
use crate::error::{driver, DriverError, EngineError, Result};
use crate::image::Image;
use crate::locks::UsfGuard;
use crate::renderer::Tracked;
use crate::utility::SamplerInfo;
use ash::vk;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Type of one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    UniformBuffer,
    StorageBuffer,
    /// Combined image sampler using a cached sampler.
    Texture(SamplerInfo),
    StorageImage,
}

impl UniformType {
    fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::Texture(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// One binding of a factory's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    pub binding: u32,
    pub ty: UniformType,
    pub stages: vk::ShaderStageFlags,
}

impl UniformBinding {
    pub fn new(binding: u32, ty: UniformType, stages: vk::ShaderStageFlags) -> Self {
        Self { binding, ty, stages }
    }
}

/// Resource bound to a uniform set binding.
#[derive(Clone, Copy)]
pub enum UniformAttachment<'a> {
    Buffer { binding: u32, buffer: &'a Buffer },
    Image { binding: u32, image: &'a Image },
}

impl UniformAttachment<'_> {
    fn binding(&self) -> u32 {
        match self {
            Self::Buffer { binding, .. } | Self::Image { binding, .. } => *binding,
        }
    }
}

/// Identifies a factory inside [`UsfState`].
pub type FactoryId = u64;

struct FactoryEntry {
    layout: vk::DescriptorSetLayout,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    pools: Vec<vk::DescriptorPool>,
    free_sets: Vec<vk::DescriptorSet>,
    refs: usize,
}

/// State behind the `usf` lock.
#[derive(Default)]
pub struct UsfState {
    factories: HashMap<FactoryId, FactoryEntry>,
    next_id: FactoryId,
}

impl UsfState {
    /// Live factories, including released ones still referenced.
    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    /// Reference count of a factory.
    pub fn refs(&self, id: FactoryId) -> Option<usize> {
        self.factories.get(&id).map(|e| e.refs)
    }

    /// Descriptor pools created by a factory.
    pub fn pool_count(&self, id: FactoryId) -> Option<usize> {
        self.factories.get(&id).map(|e| e.pools.len())
    }

    fn entry(&mut self, id: FactoryId) -> Result<&mut FactoryEntry> {
        self.factories
            .get_mut(&id)
            .ok_or_else(|| EngineError::Other(format!("uniform set factory {id} is gone")))
    }

    fn insert(&mut self, entry: FactoryEntry) -> FactoryId {
        self.next_id += 1;
        self.factories.insert(self.next_id, entry);
        self.next_id
    }

    fn retain(&mut self, id: FactoryId) -> Result<()> {
        self.entry(id)?.refs += 1;
        Ok(())
    }

    /// Drop one reference. Returns the factory's handles once none remain.
    pub(crate) fn release(&mut self, id: FactoryId) -> Option<FactoryRelease> {
        let entry = self.factories.get_mut(&id)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return None;
        }
        let entry = self.factories.remove(&id)?;
        Some(FactoryRelease {
            layout: entry.layout,
            pools: entry.pools,
        })
    }

    fn return_sets(&mut self, id: FactoryId, sets: Vec<vk::DescriptorSet>) {
        if let Some(entry) = self.factories.get_mut(&id) {
            entry.free_sets.extend(sets);
        }
    }

    /// Destroy every remaining factory.
    ///
    /// # Safety
    /// The device must be idle.
    pub(crate) unsafe fn destroy_all(&mut self, device: &dyn Device) {
        let leaked = self.factories.values().filter(|e| e.refs > 0).count();
        if leaked > 0 {
            tracing::warn!("{leaked} uniform set factories still referenced at teardown");
        }
        for (_, entry) in self.factories.drain() {
            FactoryRelease {
                layout: entry.layout,
                pools: entry.pools,
            }
            .destroy_with(device);
        }
    }
}

/// Handles of a factory whose last reference is gone.
pub struct FactoryRelease {
    layout: vk::DescriptorSetLayout,
    pools: Vec<vk::DescriptorPool>,
}

impl FactoryRelease {
    unsafe fn destroy_with(self, device: &dyn Device) {
        for pool in self.pools {
            device.destroy_descriptor_pool(pool);
        }
        device.destroy_descriptor_set_layout(self.layout);
    }

    /// # Safety
    /// No set allocated from the factory may be in use.
    pub(crate) unsafe fn destroy(self, core: &Core) {
        self.destroy_with(core.device.as_ref());
    }
}

/// Drop one factory reference from the destructor worker, destroying the
/// factory inline when it was the last.
///
/// # Safety
/// Called only after the referencing object's last frame retired.
pub(crate) unsafe fn release_factory(core: &Core, id: FactoryId) {
    let release = core.locks.usf_lock().release(id);
    if let Some(release) = release {
        release.destroy(core);
    }
}

/// Descriptor set layout plus the pools sets are allocated from.
pub struct UniformSetFactory {
    engine: Engine,
    id: FactoryId,
    mode: UpdateMode,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<UniformBinding>,
}

impl UniformSetFactory {
    /// Create a factory for sets with `bindings`.
    ///
    /// [`UpdateMode::Asynchronous`] factories give each uniform set one
    /// descriptor set per frame in flight.
    pub fn new(engine: &Engine, mode: UpdateMode, bindings: &[UniformBinding]) -> Result<Self> {
        engine.check_live()?;
        if bindings.is_empty() {
            return Err(EngineError::validation("uniform set factory needs bindings"));
        }
        for (i, b) in bindings.iter().enumerate() {
            if bindings[..i].iter().any(|other| other.binding == b.binding) {
                return Err(EngineError::validation(format!(
                    "duplicate uniform binding {}",
                    b.binding
                )));
            }
        }

        let vk_bindings: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.ty.descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(b.stages)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        // SAFETY: the device is valid.
        let layout = unsafe { engine.device().create_descriptor_set_layout(&info) }
            .map_err(driver("vkCreateDescriptorSetLayout"))?;

        let sets_per_pool = engine.config().descriptor_pool_sets;
        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for b in bindings {
            let ty = b.ty.descriptor_type();
            match pool_sizes.iter_mut().find(|s| s.ty == ty) {
                Some(size) => size.descriptor_count += sets_per_pool,
                None => pool_sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: sets_per_pool,
                }),
            }
        }

        let id = engine.usf_lock().insert(FactoryEntry {
            layout,
            pool_sizes,
            pools: Vec::new(),
            free_sets: Vec::new(),
            refs: 1,
        });

        Ok(Self {
            engine: engine.clone(),
            id,
            mode,
            layout,
            bindings: bindings.to_vec(),
        })
    }

    pub fn id(&self) -> FactoryId {
        self.id
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn bindings(&self) -> &[UniformBinding] {
        &self.bindings
    }

    /// Descriptor sets per uniform set.
    pub fn copies(&self) -> usize {
        match self.mode {
            UpdateMode::Asynchronous => self.engine.frames_in_flight(),
            UpdateMode::Synchronous | UpdateMode::Static => 1,
        }
    }

    pub(crate) fn retain(&self, usf: &mut UsfGuard<'_>) -> Result<()> {
        usf.retain(self.id)
    }

    /// Take `count` sets from the free list or the pools. Sets taken before
    /// a failure go back to the free list.
    fn allocate_sets(
        &self,
        usf: &mut UsfGuard<'_>,
        count: usize,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut sets = Vec::with_capacity(count);
        match self.fill_sets(usf, &mut sets, count) {
            Ok(()) => Ok(sets),
            Err(e) => {
                usf.return_sets(self.id, sets);
                Err(e)
            }
        }
    }

    /// Grows the pool list when the newest pool is exhausted.
    fn fill_sets(
        &self,
        usf: &mut UsfGuard<'_>,
        sets: &mut Vec<vk::DescriptorSet>,
        count: usize,
    ) -> Result<()> {
        let core = self.engine.core();
        while sets.len() < count {
            let (pool, pool_sizes) = {
                let entry = usf.entry(self.id)?;
                if let Some(set) = entry.free_sets.pop() {
                    sets.push(set);
                    continue;
                }
                (entry.pools.last().copied(), entry.pool_sizes.clone())
            };

            if let Some(pool) = pool {
                match core.allocate_descriptor_sets_locked(usf, pool, self.layout, 1) {
                    Ok(new) => {
                        sets.extend(new);
                        continue;
                    }
                    Err(
                        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL,
                    ) => {}
                    Err(result) => {
                        return Err(DriverError::log("vkAllocateDescriptorSets", result).into())
                    }
                }
            }

            let max_sets = core.config.descriptor_pool_sets;
            let pool = core.new_descriptor_pool_locked(usf, &pool_sizes, max_sets)?;
            let entry = usf.entry(self.id)?;
            entry.pools.push(pool);
            tracing::debug!(
                "uniform set factory {}: descriptor pool {} ({max_sets} sets)",
                self.id,
                entry.pools.len()
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for UniformSetFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniformSetFactory")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl Drop for UniformSetFactory {
    fn drop(&mut self) {
        let release = self.engine.usf_lock().release(self.id);
        if let Some(release) = release {
            self.engine
                .delete_object(Object::UniformSetFactory(release));
        }
    }
}

/// Descriptor sets of a released uniform set.
pub struct UniformSetResources {
    factory: FactoryId,
    sets: Vec<vk::DescriptorSet>,
    pub(crate) ts: u64,
}

impl UniformSetResources {
    /// Return the sets to the factory's free list and drop the reference.
    ///
    /// # Safety
    /// No pending GPU work may use the sets.
    pub(crate) unsafe fn destroy(self, core: &Core) {
        let release = {
            let mut usf = core.locks.usf_lock();
            usf.return_sets(self.factory, self.sets);
            usf.release(self.factory)
        };
        if let Some(release) = release {
            release.destroy(core);
        }
    }
}

/// Descriptor sets with resources attached, one per copy.
pub struct UniformSet {
    engine: Engine,
    factory: FactoryId,
    set_index: u32,
    sets: Vec<vk::DescriptorSet>,
    ts: AtomicU64,
}

enum InfoSlot {
    Buffer(usize),
    Image(usize),
}

impl UniformSet {
    /// Allocate sets from `factory` and attach one resource per binding.
    ///
    /// `set_index` is the set number the shaders declare.
    pub fn new(
        engine: &Engine,
        set_index: u32,
        factory: &UniformSetFactory,
        attachments: &[UniformAttachment<'_>],
    ) -> Result<Self> {
        engine.check_live()?;
        let bindings = factory.bindings();
        if attachments.len() != bindings.len() {
            return Err(EngineError::validation(format!(
                "uniform set needs {} attachments, got {}",
                bindings.len(),
                attachments.len()
            )));
        }

        // Samplers come from the utility lock, taken before the usf lock.
        let mut resolved = Vec::with_capacity(bindings.len());
        for attachment in attachments {
            let Some(binding) = bindings.iter().find(|b| b.binding == attachment.binding()) else {
                return Err(EngineError::validation(format!(
                    "no uniform binding {}",
                    attachment.binding()
                )));
            };
            let sampler = match (binding.ty, attachment) {
                (UniformType::UniformBuffer, UniformAttachment::Buffer { buffer, .. })
                | (UniformType::StorageBuffer, UniformAttachment::Buffer { buffer, .. })
                    if buffer.usage().descriptor_type() == Some(binding.ty.descriptor_type()) =>
                {
                    vk::Sampler::null()
                }
                (UniformType::Texture(info), UniformAttachment::Image { .. }) => {
                    engine.sampler(info)?
                }
                (UniformType::StorageImage, UniformAttachment::Image { .. }) => vk::Sampler::null(),
                _ => {
                    return Err(EngineError::validation(format!(
                        "attachment does not match uniform binding {}",
                        binding.binding
                    )))
                }
            };
            resolved.push((*binding, *attachment, sampler));
        }

        let copies = factory.copies();
        let sets = {
            let mut usf = engine.usf_lock();
            let sets = factory.allocate_sets(&mut usf, copies)?;
            if let Err(e) = factory.retain(&mut usf) {
                usf.return_sets(factory.id, sets);
                return Err(e);
            }
            sets
        };

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut plan = Vec::new();
        for (copy, &set) in sets.iter().enumerate() {
            for (binding, attachment, sampler) in &resolved {
                let slot = match attachment {
                    UniformAttachment::Buffer { buffer, .. } => {
                        buffer_infos.push(
                            vk::DescriptorBufferInfo::default()
                                .buffer(buffer.handle_at(copy))
                                .offset(0)
                                .range(vk::WHOLE_SIZE),
                        );
                        InfoSlot::Buffer(buffer_infos.len() - 1)
                    }
                    UniformAttachment::Image { image, .. } => {
                        let layout = match binding.ty {
                            UniformType::StorageImage => vk::ImageLayout::GENERAL,
                            _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        };
                        image_infos.push(
                            vk::DescriptorImageInfo::default()
                                .sampler(*sampler)
                                .image_view(image.view())
                                .image_layout(layout),
                        );
                        InfoSlot::Image(image_infos.len() - 1)
                    }
                };
                plan.push((set, binding.binding, binding.ty.descriptor_type(), slot));
            }
        }

        let writes: Vec<_> = plan
            .iter()
            .map(|(set, binding, ty, slot)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                match slot {
                    InfoSlot::Buffer(i) => {
                        write.buffer_info(std::slice::from_ref(&buffer_infos[*i]))
                    }
                    InfoSlot::Image(i) => write.image_info(std::slice::from_ref(&image_infos[*i])),
                }
            })
            .collect();
        // SAFETY: the sets are freshly taken and not in use.
        unsafe { engine.device().update_descriptor_sets(&writes) };

        Ok(Self {
            engine: engine.clone(),
            factory: factory.id,
            set_index,
            sets,
            ts: AtomicU64::new(0),
        })
    }

    /// Set number the shaders declare.
    pub fn set_index(&self) -> u32 {
        self.set_index
    }

    /// Descriptor set for the current frame slot.
    pub fn handle(&self) -> vk::DescriptorSet {
        self.sets[self.engine.frame_slot() % self.sets.len()]
    }

    pub fn copies(&self) -> usize {
        self.sets.len()
    }
}

impl Tracked for UniformSet {
    fn mark_used(&self, ts: u64) {
        self.ts.fetch_max(ts, Ordering::AcqRel);
    }
}

impl Drop for UniformSet {
    fn drop(&mut self) {
        let resources = UniformSetResources {
            factory: self.factory,
            sets: std::mem::take(&mut self.sets),
            ts: self.ts.load(Ordering::Acquire),
        };
        self.engine.delete_object(Object::UniformSet(resources));
    }
}
