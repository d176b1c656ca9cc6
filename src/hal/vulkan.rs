//! Vulkan implementation of [`Driver`].
//!
//! The driver does not create the instance or the device. It takes a logical device that
//! has the following enabled:
//!
//! - Vulkan 1.3, or 1.2 with `VK_KHR_synchronization2`
//! - `timelineSemaphore`, `bufferDeviceAddress`
//! - `VK_EXT_mutable_descriptor_type`
//! - `descriptorBindingPartiallyBound`, `descriptorBindingUpdateUnusedWhilePending` and the
//!   update-after-bind features for every descriptor type in [`RESOURCE_DESCRIPTOR_TYPES`]
//!
//! # Mapping
//!
//! | Driver object      | Vulkan object                                                   |
//! |--------------------|-----------------------------------------------------------------|
//! | fence              | timeline semaphore                                              |
//! | recording buffer   | a primary command buffer with a command pool of its own         |
//! | buffer             | a `vk-mem` buffer                                               |
//! | CPU view table     | a host array of [`ViewDesc`]                                    |
//! | GPU view table     | a descriptor set with one array binding                         |
//!
//! A table bound to slot `n` of a pipeline is bound as descriptor set `n`, and the offset of
//! the bound range is pushed as a `u32` push constant at byte `4 * n`. Pipeline layouts must
//! therefore reserve a push constant range of `4 * MAX_SLOTS` bytes for all stages.
//!
//! Pipelines and images are created by the caller and made known to the driver with
//! [`VulkanDriver::register_pipeline`] and [`VulkanDriver::register_image`].

use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ash::vk::{self, Handle};
use vk_mem::Alloc;

use super::{
    Barrier, BindPoint, BufferAllocation, Command, CpuView, Driver, MemoryKind, QueueKind,
    RawBuffer, RawCommandBuffer, RawFence, RawResource, RawViewTable, ViewDesc, ViewTableKind,
};
use crate::{descriptor::MAX_SLOTS, error::Result, tracking::ResourceStates};

/// Descriptor types a resource view table can hold.
pub const RESOURCE_DESCRIPTOR_TYPES: [vk::DescriptorType; 4] = [
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::SAMPLED_IMAGE,
    vk::DescriptorType::STORAGE_IMAGE,
];

/// Set in the handles of host-side view tables so they never collide with descriptor sets.
const CPU_TABLE_TAG: u64 = 1 << 63;

/// A queue handle together with its family.
#[derive(Clone, Copy, Debug)]
pub struct VulkanQueue {
    pub handle: vk::Queue,
    pub family_index: u32,
}

struct CommandEntry {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    queue: QueueKind,
    /// Layout of the pipeline bound at each [`BindPoint`].
    layouts: [vk::PipelineLayout; 2],
}

struct BufferEntry {
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
}
unsafe impl Send for BufferEntry {}
unsafe impl Sync for BufferEntry {}

enum TableEntry {
    Cpu {
        kind: ViewTableKind,
        views: Vec<ViewDesc>,
    },
    Gpu {
        kind: ViewTableKind,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        set: vk::DescriptorSet,
    },
}

#[derive(Default)]
struct QueueState {
    /// Semaphore waits every later submission of the queue must honor. An entry is dropped
    /// once the semaphore is observed past its value.
    waits: Vec<(vk::Semaphore, u64)>,
}

/// A [`Driver`] over an `ash` logical device.
pub struct VulkanDriver {
    device: ash::Device,
    allocator: vk_mem::Allocator,
    queues: [VulkanQueue; 3],
    queue_state: [Mutex<QueueState>; 3],
    families: Vec<u32>,
    command_buffers: Mutex<HashMap<u64, CommandEntry>>,
    buffers: Mutex<HashMap<u64, BufferEntry>>,
    tables: Mutex<HashMap<u64, TableEntry>>,
    next_cpu_table: AtomicU64,
    pipelines: Mutex<HashMap<u64, (vk::PipelineBindPoint, vk::PipelineLayout)>>,
    images: Mutex<HashMap<u64, vk::ImageAspectFlags>>,
}

impl VulkanDriver {
    /// Wraps `device`. `queues` is indexed by [`QueueKind::index`]; kinds may share a queue.
    ///
    /// The device is not destroyed when the driver is dropped.
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        queues: [VulkanQueue; 3],
    ) -> Result<Self> {
        let mut info = vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device);
        info.flags |= vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        let allocator = unsafe { vk_mem::Allocator::new(info)? };

        let mut families: Vec<u32> = queues.iter().map(|q| q.family_index).collect();
        families.sort_unstable();
        families.dedup();
        tracing::info!(?families, "vulkan driver created");
        Ok(Self {
            device,
            allocator,
            queues,
            queue_state: Default::default(),
            families,
            command_buffers: Mutex::default(),
            buffers: Mutex::default(),
            tables: Mutex::default(),
            next_cpu_table: AtomicU64::new(1),
            pipelines: Mutex::default(),
            images: Mutex::default(),
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Makes a pipeline bindable through [`Command::BindPipeline`].
    pub fn register_pipeline(
        &self,
        pipeline: vk::Pipeline,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
    ) -> RawResource {
        self.pipelines
            .lock()
            .unwrap()
            .insert(pipeline.as_raw(), (bind_point, layout));
        RawResource(pipeline.as_raw())
    }

    pub fn unregister_pipeline(&self, pipeline: RawResource) {
        self.pipelines.lock().unwrap().remove(&pipeline.0);
    }

    /// Makes an image usable in [`Barrier`]s. Any other [`RawResource`] named by a barrier is
    /// taken to be a buffer.
    pub fn register_image(&self, image: vk::Image, aspect: vk::ImageAspectFlags) -> RawResource {
        self.images.lock().unwrap().insert(image.as_raw(), aspect);
        RawResource(image.as_raw())
    }

    pub fn unregister_image(&self, image: RawResource) {
        self.images.lock().unwrap().remove(&image.0);
    }

    /// Resolves a buffer handle to the native buffer.
    pub fn vk_buffer(&self, buffer: RawBuffer) -> vk::Buffer {
        vk::Buffer::from_raw(buffer.0)
    }

    fn supported_stages(queue: QueueKind) -> vk::PipelineStageFlags2 {
        match queue {
            QueueKind::Graphics => vk::PipelineStageFlags2::ALL_COMMANDS,
            QueueKind::Compute => {
                vk::PipelineStageFlags2::COMPUTE_SHADER
                    | vk::PipelineStageFlags2::DRAW_INDIRECT
                    | vk::PipelineStageFlags2::ALL_TRANSFER
            }
            QueueKind::Copy => vk::PipelineStageFlags2::ALL_TRANSFER,
        }
    }

    fn record_barriers(&self, buffer: vk::CommandBuffer, queue: QueueKind, barriers: &[Barrier]) {
        let images = self.images.lock().unwrap();
        let mut memory_barriers = Vec::new();
        let mut buffer_barriers = Vec::new();
        let mut image_barriers = Vec::new();
        for barrier in barriers {
            match *barrier {
                Barrier::Uav { .. } => {
                    memory_barriers.push(
                        vk::MemoryBarrier2::default()
                            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .src_access_mask(vk::AccessFlags2::SHADER_STORAGE_WRITE)
                            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .dst_access_mask(
                                vk::AccessFlags2::SHADER_STORAGE_READ
                                    | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                            ),
                    );
                }
                Barrier::Transition {
                    resource,
                    before,
                    after,
                } => {
                    let (src_stage, src_access) = stage_access(before, queue);
                    let (dst_stage, dst_access) = stage_access(after, queue);
                    if let Some(&aspect) = images.get(&resource.0) {
                        image_barriers.push(
                            vk::ImageMemoryBarrier2::default()
                                .src_stage_mask(src_stage)
                                .src_access_mask(src_access)
                                .dst_stage_mask(dst_stage)
                                .dst_access_mask(dst_access)
                                .old_layout(image_layout(before))
                                .new_layout(image_layout(after))
                                .image(vk::Image::from_raw(resource.0))
                                .subresource_range(vk::ImageSubresourceRange {
                                    aspect_mask: aspect,
                                    base_mip_level: 0,
                                    level_count: vk::REMAINING_MIP_LEVELS,
                                    base_array_layer: 0,
                                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                                }),
                        );
                    } else {
                        buffer_barriers.push(
                            vk::BufferMemoryBarrier2::default()
                                .src_stage_mask(src_stage)
                                .src_access_mask(src_access)
                                .dst_stage_mask(dst_stage)
                                .dst_access_mask(dst_access)
                                .buffer(vk::Buffer::from_raw(resource.0))
                                .offset(0)
                                .size(vk::WHOLE_SIZE),
                        );
                    }
                }
            }
        }
        drop(images);
        let info = vk::DependencyInfo::default()
            .memory_barriers(&memory_barriers)
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(buffer, &info) };
    }

    fn write_descriptor(&self, set: vk::DescriptorSet, index: u32, view: &ViewDesc) {
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .dst_array_element(index);
        match *view {
            // Partially bound: unwritten entries may stay undefined as long as shaders skip them.
            ViewDesc::Null => {}
            ViewDesc::UniformBuffer { buffer, offset, size }
            | ViewDesc::StorageBuffer { buffer, offset, size } => {
                let ty = if matches!(view, ViewDesc::UniformBuffer { .. }) {
                    vk::DescriptorType::UNIFORM_BUFFER
                } else {
                    vk::DescriptorType::STORAGE_BUFFER
                };
                let info = [vk::DescriptorBufferInfo {
                    buffer: vk::Buffer::from_raw(buffer.0),
                    offset,
                    range: size,
                }];
                let write = write.descriptor_type(ty).buffer_info(&info);
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
            ViewDesc::SampledTexture { view: image_view }
            | ViewDesc::StorageTexture { view: image_view } => {
                let (ty, image_layout) = if matches!(view, ViewDesc::SampledTexture { .. }) {
                    (vk::DescriptorType::SAMPLED_IMAGE, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                } else {
                    (vk::DescriptorType::STORAGE_IMAGE, vk::ImageLayout::GENERAL)
                };
                let info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: vk::ImageView::from_raw(image_view.0),
                    image_layout,
                }];
                unsafe {
                    self.device
                        .update_descriptor_sets(&[write.descriptor_type(ty).image_info(&info)], &[])
                };
            }
            ViewDesc::Sampler { sampler } => {
                let info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::from_raw(sampler.0),
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }];
                unsafe {
                    self.device.update_descriptor_sets(
                        &[write.descriptor_type(vk::DescriptorType::SAMPLER).image_info(&info)],
                        &[],
                    )
                };
            }
        }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        let leaked = self.command_buffers.lock().unwrap().len()
            + self.buffers.lock().unwrap().len()
            + self.tables.lock().unwrap().len();
        if leaked > 0 {
            tracing::warn!(leaked, "vulkan driver dropped with live objects");
        }
    }
}

/// Pipeline stages and access masks covering every use in `states`.
fn stage_access(
    states: ResourceStates,
    queue: QueueKind,
) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    use vk::{AccessFlags2 as A, PipelineStageFlags2 as S};
    if states.is_empty() {
        return (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE);
    }
    let shaders = S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER;
    let fragment_tests = S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS;
    let uses = [
        (ResourceStates::VERTEX_BUFFER, S::VERTEX_ATTRIBUTE_INPUT, A::VERTEX_ATTRIBUTE_READ),
        (ResourceStates::CONSTANT_BUFFER, shaders, A::UNIFORM_READ),
        (ResourceStates::INDEX_BUFFER, S::INDEX_INPUT, A::INDEX_READ),
        (
            ResourceStates::RENDER_TARGET,
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
        ),
        (
            ResourceStates::UNORDERED_ACCESS,
            shaders,
            A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
        ),
        (
            ResourceStates::DEPTH_WRITE,
            fragment_tests,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (ResourceStates::DEPTH_READ, fragment_tests, A::DEPTH_STENCIL_ATTACHMENT_READ),
        (
            ResourceStates::NON_PIXEL_SHADER_RESOURCE,
            S::VERTEX_SHADER | S::COMPUTE_SHADER,
            A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
        ),
        (
            ResourceStates::PIXEL_SHADER_RESOURCE,
            S::FRAGMENT_SHADER,
            A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
        ),
        (ResourceStates::INDIRECT_ARGUMENT, S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ),
        (ResourceStates::COPY_DEST, S::ALL_TRANSFER, A::TRANSFER_WRITE),
        (ResourceStates::COPY_SOURCE, S::ALL_TRANSFER, A::TRANSFER_READ),
    ];
    let mut stages = S::empty();
    let mut access = A::empty();
    for (state, s, a) in uses {
        if states.contains(state) {
            stages |= s;
            access |= a;
        }
    }
    if queue != QueueKind::Graphics {
        stages &= VulkanDriver::supported_stages(queue);
        if stages.is_empty() {
            stages = S::ALL_COMMANDS;
        }
    }
    (stages, access)
}

/// The image layout an image in `states` is kept in.
fn image_layout(states: ResourceStates) -> vk::ImageLayout {
    let shader_read =
        ResourceStates::NON_PIXEL_SHADER_RESOURCE | ResourceStates::PIXEL_SHADER_RESOURCE;
    if states == ResourceStates::RENDER_TARGET {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else if states == ResourceStates::DEPTH_WRITE {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else if states.contains(ResourceStates::DEPTH_READ)
        && (states - ResourceStates::DEPTH_READ - shader_read).is_empty()
    {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else if !states.is_empty() && shader_read.contains(states) {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else if states == ResourceStates::COPY_DEST {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    } else if states == ResourceStates::COPY_SOURCE {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    } else {
        vk::ImageLayout::GENERAL
    }
}

fn vk_bind_point(bind_point: BindPoint) -> vk::PipelineBindPoint {
    match bind_point {
        BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

fn bind_point_index(bind_point: BindPoint) -> usize {
    match bind_point {
        BindPoint::Graphics => 0,
        BindPoint::Compute => 1,
    }
}

fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

impl Driver for VulkanDriver {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn create_fence(&self, initial_value: u64) -> Result<RawFence> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.device.create_semaphore(&info, None)? };
        Ok(RawFence(semaphore.as_raw()))
    }

    fn destroy_fence(&self, fence: RawFence) {
        unsafe {
            self.device
                .destroy_semaphore(vk::Semaphore::from_raw(fence.0), None)
        };
    }

    fn fence_value(&self, fence: RawFence) -> Result<u64> {
        let value = unsafe {
            self.device
                .get_semaphore_counter_value(vk::Semaphore::from_raw(fence.0))?
        };
        Ok(value)
    }

    fn wait_fence(&self, fence: RawFence, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let semaphores = [vk::Semaphore::from_raw(fence.0)];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.device.wait_semaphores(&info, timeout_ns(timeout)) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn signal_fence(&self, fence: RawFence, value: u64) -> Result<()> {
        if self.fence_value(fence)? >= value {
            return Ok(());
        }
        let info = vk::SemaphoreSignalInfo::default()
            .semaphore(vk::Semaphore::from_raw(fence.0))
            .value(value);
        unsafe { self.device.signal_semaphore(&info)? };
        Ok(())
    }

    fn queue_submit(
        &self,
        queue: QueueKind,
        buffers: &[RawCommandBuffer],
        fence: RawFence,
        value: u64,
    ) -> Result<()> {
        let command_buffer_infos: Vec<vk::CommandBufferSubmitInfo> = {
            let entries = self.command_buffers.lock().unwrap();
            buffers
                .iter()
                .map(|raw| {
                    let entry = entries
                        .get(&raw.0)
                        .unwrap_or_else(|| panic!("unknown recording buffer {raw:?}"));
                    debug_assert_eq!(entry.queue, queue);
                    vk::CommandBufferSubmitInfo::default().command_buffer(entry.buffer)
                })
                .collect()
        };

        let mut state = self.queue_state[queue.index()].lock().unwrap();
        state.waits.retain(|&(semaphore, value)| {
            unsafe { self.device.get_semaphore_counter_value(semaphore) }
                .map_or(true, |current| current < value)
        });
        let waits: Vec<vk::SemaphoreSubmitInfo> = state
            .waits
            .iter()
            .map(|&(semaphore, value)| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .value(value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(vk::Semaphore::from_raw(fence.0))
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffer_infos)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.device.queue_submit2(
                self.queues[queue.index()].handle,
                &[submit],
                vk::Fence::null(),
            )?
        };
        Ok(())
    }

    fn queue_wait(&self, queue: QueueKind, fence: RawFence, value: u64) -> Result<()> {
        let semaphore = vk::Semaphore::from_raw(fence.0);
        let mut state = self.queue_state[queue.index()].lock().unwrap();
        match state.waits.iter_mut().find(|(s, _)| *s == semaphore) {
            Some((_, waited)) => *waited = (*waited).max(value),
            None => state.waits.push((semaphore, value)),
        }
        Ok(())
    }

    fn create_command_buffer(&self, queue: QueueKind) -> Result<RawCommandBuffer> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.queues[queue.index()].family_index);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None)? };
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(err) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };
        let raw = RawCommandBuffer(buffer.as_raw());
        self.command_buffers.lock().unwrap().insert(
            raw.0,
            CommandEntry {
                pool,
                buffer,
                queue,
                layouts: [vk::PipelineLayout::null(); 2],
            },
        );
        Ok(raw)
    }

    fn destroy_command_buffer(&self, buffer: RawCommandBuffer) {
        if let Some(entry) = self.command_buffers.lock().unwrap().remove(&buffer.0) {
            // Destroying the pool frees the buffer.
            unsafe { self.device.destroy_command_pool(entry.pool, None) };
        }
    }

    fn begin_command_buffer(&self, buffer: RawCommandBuffer) -> Result<()> {
        let mut entries = self.command_buffers.lock().unwrap();
        let entry = entries
            .get_mut(&buffer.0)
            .unwrap_or_else(|| panic!("unknown recording buffer {buffer:?}"));
        entry.layouts = [vk::PipelineLayout::null(); 2];
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .reset_command_pool(entry.pool, vk::CommandPoolResetFlags::empty())?;
            self.device.begin_command_buffer(entry.buffer, &info)?;
        }
        Ok(())
    }

    fn end_command_buffer(&self, buffer: RawCommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .end_command_buffer(vk::CommandBuffer::from_raw(buffer.0))?
        };
        Ok(())
    }

    fn record(&self, buffer: RawCommandBuffer, command: Command) {
        let cb = vk::CommandBuffer::from_raw(buffer.0);
        match command {
            Command::Barriers(barriers) => {
                let queue = self
                    .command_buffers
                    .lock()
                    .unwrap()
                    .get(&buffer.0)
                    .map(|entry| entry.queue)
                    .unwrap_or_else(|| panic!("unknown recording buffer {buffer:?}"));
                self.record_barriers(cb, queue, &barriers);
            }
            Command::BindPipeline { bind_point, pipeline } => {
                let (vk_point, layout) = *self
                    .pipelines
                    .lock()
                    .unwrap()
                    .get(&pipeline.0)
                    .unwrap_or_else(|| panic!("pipeline {pipeline:?} was never registered"));
                assert_eq!(
                    vk_point,
                    vk_bind_point(bind_point),
                    "pipeline bound at the wrong bind point"
                );
                if let Some(entry) = self.command_buffers.lock().unwrap().get_mut(&buffer.0) {
                    entry.layouts[bind_point_index(bind_point)] = layout;
                }
                unsafe {
                    self.device
                        .cmd_bind_pipeline(cb, vk_point, vk::Pipeline::from_raw(pipeline.0))
                };
            }
            Command::BindViewTable {
                bind_point,
                slot,
                kind,
                table,
                offset,
            } => {
                let layout = self
                    .command_buffers
                    .lock()
                    .unwrap()
                    .get(&buffer.0)
                    .map(|entry| entry.layouts[bind_point_index(bind_point)])
                    .unwrap_or_default();
                assert!(!layout.is_null(), "view table bound before any pipeline");
                let set = match self.tables.lock().unwrap().get(&table.0) {
                    Some(TableEntry::Gpu { kind: table_kind, set, .. }) => {
                        assert_eq!(*table_kind, kind);
                        *set
                    }
                    _ => panic!("{table:?} is not a shader-visible view table"),
                };
                debug_assert!((slot as usize) < MAX_SLOTS);
                unsafe {
                    self.device.cmd_bind_descriptor_sets(
                        cb,
                        vk_bind_point(bind_point),
                        layout,
                        slot,
                        &[set],
                        &[],
                    );
                    self.device.cmd_push_constants(
                        cb,
                        layout,
                        vk::ShaderStageFlags::ALL,
                        slot * 4,
                        &offset.to_ne_bytes(),
                    );
                }
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                self.device
                    .cmd_draw(cb, vertex_count, instance_count, first_vertex, first_instance)
            },
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                self.device.cmd_draw_indexed(
                    cb,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                )
            },
            Command::Dispatch { x, y, z } => unsafe { self.device.cmd_dispatch(cb, x, y, z) },
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => unsafe {
                self.device.cmd_copy_buffer(
                    cb,
                    vk::Buffer::from_raw(src.0),
                    vk::Buffer::from_raw(dst.0),
                    &[vk::BufferCopy {
                        src_offset,
                        dst_offset,
                        size,
                    }],
                )
            },
            Command::FillBuffer {
                dst,
                offset,
                size,
                value,
            } => unsafe {
                self.device
                    .cmd_fill_buffer(cb, vk::Buffer::from_raw(dst.0), offset, size, value)
            },
        }
    }

    fn create_buffer(&self, kind: MemoryKind, size: u64) -> Result<BufferAllocation> {
        let usage = vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDIRECT_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let mut buffer_info = vk::BufferCreateInfo::default().size(size).usage(usage);
        if self.families.len() > 1 {
            buffer_info = buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&self.families);
        }
        let alloc_info = match kind {
            MemoryKind::Upload => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            MemoryKind::Scratch => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::empty(),
                ..Default::default()
            },
        };
        let (buffer, allocation) =
            unsafe { self.allocator.create_buffer(&buffer_info, &alloc_info)? };
        let mapped = match kind {
            MemoryKind::Upload => {
                NonNull::new(self.allocator.get_allocation_info(&allocation).mapped_data as *mut u8)
            }
            MemoryKind::Scratch => None,
        };
        let gpu_address = unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };
        let handle = RawBuffer(buffer.as_raw());
        self.buffers
            .lock()
            .unwrap()
            .insert(handle.0, BufferEntry { buffer, allocation });
        Ok(BufferAllocation {
            handle,
            mapped,
            gpu_address,
        })
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        if let Some(mut entry) = self.buffers.lock().unwrap().remove(&buffer.0) {
            unsafe {
                self.allocator
                    .destroy_buffer(entry.buffer, &mut entry.allocation)
            };
        }
    }

    fn create_view_table(
        &self,
        kind: ViewTableKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<RawViewTable> {
        if !shader_visible {
            // Vulkan has no CPU-only descriptor heap; staging tables live on the host.
            let views = vec![ViewDesc::Null; capacity as usize];
            let key = CPU_TABLE_TAG | self.next_cpu_table.fetch_add(1, Ordering::Relaxed);
            self.tables
                .lock()
                .unwrap()
                .insert(key, TableEntry::Cpu { kind, views });
            return Ok(RawViewTable(key));
        }

        let ty = match kind {
            ViewTableKind::Resource => vk::DescriptorType::MUTABLE_EXT,
            ViewTableKind::Sampler => vk::DescriptorType::SAMPLER,
        };
        let lists = [vk::MutableDescriptorTypeListEXT::default()
            .descriptor_types(&RESOURCE_DESCRIPTOR_TYPES)];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING];
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(ty)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL)];

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let mut layout_mutability =
            vk::MutableDescriptorTypeCreateInfoEXT::default().mutable_descriptor_type_lists(&lists);
        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        if kind == ViewTableKind::Resource {
            layout_info = layout_info.push_next(&mut layout_mutability);
        }
        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None)? };

        let sizes = [vk::DescriptorPoolSize {
            ty,
            descriptor_count: capacity,
        }];
        let mut pool_mutability =
            vk::MutableDescriptorTypeCreateInfoEXT::default().mutable_descriptor_type_lists(&lists);
        let mut pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&sizes);
        if kind == ViewTableKind::Resource {
            pool_info = pool_info.push_next(&mut pool_mutability);
        }
        let pool = match unsafe { self.device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
                return Err(err.into());
            }
        };
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(err) => {
                unsafe {
                    self.device.destroy_descriptor_pool(pool, None);
                    self.device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(err.into());
            }
        };
        let raw = RawViewTable(set.as_raw());
        self.tables.lock().unwrap().insert(
            raw.0,
            TableEntry::Gpu {
                kind,
                pool,
                layout,
                set,
            },
        );
        Ok(raw)
    }

    fn destroy_view_table(&self, table: RawViewTable) {
        match self.tables.lock().unwrap().remove(&table.0) {
            Some(TableEntry::Cpu { .. }) => {}
            Some(TableEntry::Gpu { pool, layout, .. }) => unsafe {
                self.device.destroy_descriptor_pool(pool, None);
                self.device.destroy_descriptor_set_layout(layout, None);
            },
            None => {}
        }
    }

    fn write_view(&self, table: RawViewTable, index: u32, view: &ViewDesc) {
        let mut tables = self.tables.lock().unwrap();
        match tables.get_mut(&table.0) {
            Some(TableEntry::Cpu { kind, views }) => {
                assert!(
                    view.table_kind().is_none_or(|k| k == *kind),
                    "{view:?} cannot be placed in a {} table",
                    kind.name()
                );
                views[index as usize] = *view;
            }
            Some(&mut TableEntry::Gpu { kind, set, .. }) => {
                assert!(
                    view.table_kind().is_none_or(|k| k == kind),
                    "{view:?} cannot be placed in a {} table",
                    kind.name()
                );
                drop(tables);
                self.write_descriptor(set, index, view);
            }
            None => panic!("unknown view table {table:?}"),
        }
    }

    fn copy_views(&self, dst: RawViewTable, dst_start: u32, src: &[CpuView]) {
        let tables = self.tables.lock().unwrap();
        let set = match tables.get(&dst.0) {
            Some(TableEntry::Gpu { set, .. }) => *set,
            _ => panic!("{dst:?} is not a shader-visible view table"),
        };
        let views: Vec<ViewDesc> = src
            .iter()
            .map(|view| match tables.get(&view.table.0) {
                Some(TableEntry::Cpu { views, .. }) => views[view.index as usize],
                _ => panic!("views can only be copied out of CPU view tables"),
            })
            .collect();
        drop(tables);
        for (i, view) in views.iter().enumerate() {
            self.write_descriptor(set, dst_start + i as u32, view);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts() {
        assert_eq!(
            image_layout(ResourceStates::RENDER_TARGET),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            image_layout(
                ResourceStates::PIXEL_SHADER_RESOURCE | ResourceStates::NON_PIXEL_SHADER_RESOURCE
            ),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            image_layout(ResourceStates::DEPTH_READ | ResourceStates::PIXEL_SHADER_RESOURCE),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(image_layout(ResourceStates::COMMON), vk::ImageLayout::GENERAL);
        assert_eq!(image_layout(ResourceStates::UNORDERED_ACCESS), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn copy_queue_stages() {
        let (stages, access) = stage_access(ResourceStates::COPY_DEST, QueueKind::Copy);
        assert_eq!(stages, vk::PipelineStageFlags2::ALL_TRANSFER);
        assert_eq!(access, vk::AccessFlags2::TRANSFER_WRITE);

        let (stages, _) =
            stage_access(ResourceStates::NON_PIXEL_SHADER_RESOURCE, QueueKind::Compute);
        assert_eq!(stages, vk::PipelineStageFlags2::COMPUTE_SHADER);
    }
}
