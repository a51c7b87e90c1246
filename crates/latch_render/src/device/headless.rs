//! Headless software device
//!
//! Implements [`GpuDevice`] and [`PresentationSurface`] without a GPU. Memory
//! is plain host memory, copies execute at submission, and a fence only
//! becomes signaled once somebody waits on it. That last rule makes the
//! device strict about lifetimes: destroying or reusing anything referenced
//! by a submission whose fence nobody has waited on yet is recorded as a
//! violation, which is exactly the mistake deferred destruction exists to
//! prevent.

use super::*;
use crate::memory::align_up;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use winit::dpi::PhysicalSize;

/// Memory types exposed by default, in index order.
pub const DEFAULT_MEMORY_TYPES: [MemoryProperties; 4] = [
    MemoryProperties::DEVICE_LOCAL,
    MemoryProperties::HOST_VISIBLE.union(MemoryProperties::HOST_COHERENT),
    MemoryProperties::HOST_VISIBLE
        .union(MemoryProperties::HOST_COHERENT)
        .union(MemoryProperties::HOST_CACHED),
    MemoryProperties::DEVICE_LOCAL
        .union(MemoryProperties::HOST_VISIBLE)
        .union(MemoryProperties::HOST_COHERENT),
];

const BUFFER_ALIGNMENT: u64 = 64;
const IMAGE_ALIGNMENT: u64 = 4096;

/// Zero-initialized host allocation accessed only through its raw pointer, so
/// mapped pointers handed out earlier stay valid across later copies.
struct HostStorage {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostStorage {
    fn zeroed(len: usize) -> Self {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        Self {
            ptr: NonNull::new(raw).unwrap_or(NonNull::dangling()),
            len,
        }
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        debug_assert!(offset + len <= self.len);
        // SAFETY: range checked by every caller against the owning memory size.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len).to_vec() }
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.len);
        // SAFETY: as above; `bytes` never aliases device storage because it is
        // always a temporary produced by `read`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }
}

impl Drop for HostStorage {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from `Box::into_raw` of a boxed slice of exactly this length.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

struct Memory {
    size: u64,
    type_index: u32,
    storage: Option<HostStorage>,
    mapped: bool,
}

impl Memory {
    fn storage_mut(&mut self) -> &mut HostStorage {
        let size = self.size as usize;
        self.storage.get_or_insert_with(|| HostStorage::zeroed(size))
    }
}

struct Buffer {
    size: u64,
    usage: wgpu::BufferUsages,
    binding: Option<(MemoryHandle, u64)>,
}

struct Image {
    requirements: MemoryRequirements,
    binding: Option<(MemoryHandle, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug, Clone)]
enum Command {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        regions: Vec<BufferCopy>,
    },
    BindVertexBuffer(BufferHandle),
    BindIndexBuffer(BufferHandle),
    BindDescriptorSet(DescriptorSetHandle),
    DrawIndexed,
}

struct CommandBuffer {
    state: RecordState,
    commands: Vec<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

struct DescriptorSet {
    target: Option<(BufferHandle, u64, u64)>,
}

/// Everything one submission keeps alive until its completion is observed.
#[derive(Default)]
struct Submission {
    fence: Option<FenceHandle>,
    command_buffers: HashSet<CommandBufferHandle>,
    buffers: HashSet<BufferHandle>,
    memories: HashSet<MemoryHandle>,
    descriptor_sets: HashSet<DescriptorSetHandle>,
}

/// Running totals, handy for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub memory_allocations: u64,
    pub submissions: u64,
    pub copies: u64,
    pub bytes_copied: u64,
    pub draws: u64,
}

/// Software [`GpuDevice`].
pub struct HeadlessDevice {
    limits: DeviceLimits,
    memory_types: Vec<MemoryProperties>,
    memory_budget: Option<u64>,
    allocated_bytes: u64,
    next_id: u64,
    memories: HashMap<MemoryHandle, Memory>,
    buffers: HashMap<BufferHandle, Buffer>,
    images: HashMap<ImageHandle, Image>,
    command_buffers: HashMap<CommandBufferHandle, CommandBuffer>,
    fences: HashMap<FenceHandle, FenceState>,
    semaphores: HashSet<SemaphoreHandle>,
    descriptor_sets: HashMap<DescriptorSetHandle, DescriptorSet>,
    pending: VecDeque<Submission>,
    lost_submits: u32,
    violations: Vec<String>,
    stats: HeadlessStats,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_memory_types(DEFAULT_MEMORY_TYPES.to_vec())
    }

    pub fn with_memory_types(memory_types: Vec<MemoryProperties>) -> Self {
        Self {
            limits: DeviceLimits::default(),
            memory_types,
            memory_budget: None,
            allocated_bytes: 0,
            next_id: 1,
            memories: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            command_buffers: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            descriptor_sets: HashMap::new(),
            pending: VecDeque::new(),
            lost_submits: 0,
            violations: Vec::new(),
            stats: HeadlessStats::default(),
        }
    }

    /// Fail memory allocations once `bytes` are outstanding.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Make the next `count` submissions fail with [`DeviceError::DeviceLost`].
    pub fn fail_next_submits(&mut self, count: u32) {
        self.lost_submits += count;
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn live_memory_count(&self) -> usize {
        self.memories.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_memory_alive(&self, memory: MemoryHandle) -> bool {
        self.memories.contains_key(&memory)
    }

    pub fn is_memory_mapped(&self, memory: MemoryHandle) -> bool {
        self.memories.get(&memory).is_some_and(|m| m.mapped)
    }

    /// Memory an image is bound to, if any.
    pub fn image_binding(&self, image: ImageHandle) -> Option<(MemoryHandle, u64)> {
        self.images.get(&image).and_then(|i| i.binding)
    }

    pub fn is_buffer_alive(&self, buffer: BufferHandle) -> bool {
        self.buffers.contains_key(&buffer)
    }

    pub fn is_image_alive(&self, image: ImageHandle) -> bool {
        self.images.contains_key(&image)
    }

    pub fn is_descriptor_set_alive(&self, set: DescriptorSetHandle) -> bool {
        self.descriptor_sets.contains_key(&set)
    }

    /// Buffer the descriptor set currently points at.
    pub fn descriptor_target(&self, set: DescriptorSetHandle) -> Option<BufferHandle> {
        self.descriptor_sets
            .get(&set)
            .and_then(|s| s.target)
            .map(|(buffer, _, _)| buffer)
    }

    pub fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(&buffer).map(|b| b.size)
    }

    pub fn buffer_usage(&self, buffer: BufferHandle) -> Option<wgpu::BufferUsages> {
        self.buffers.get(&buffer).map(|b| b.usage)
    }

    /// Submissions whose completion nobody has observed yet.
    pub fn in_flight_submissions(&self) -> usize {
        self.pending.len()
    }

    /// Read back buffer contents as the GPU would see them.
    pub fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> Option<Vec<u8>> {
        let buf = self.buffers.get(&buffer)?;
        if offset + len > buf.size {
            return None;
        }
        let (memory, base) = buf.binding?;
        let mem = self.memories.get_mut(&memory)?;
        Some(mem.storage_mut().read((base + offset) as usize, len as usize))
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn violation(&mut self, message: String) {
        tracing::warn!(target: "latch_render::headless", "{message}");
        self.violations.push(message);
    }

    fn type_mask(&self, filter: impl Fn(MemoryProperties) -> bool) -> u32 {
        self.memory_types
            .iter()
            .enumerate()
            .filter(|(_, props)| filter(**props))
            .fold(0u32, |mask, (i, _)| mask | (1 << i))
    }

    fn buffer_in_flight(&self, buffer: BufferHandle) -> bool {
        self.pending.iter().any(|s| s.buffers.contains(&buffer))
    }

    fn memory_in_flight(&self, memory: MemoryHandle) -> bool {
        self.pending.iter().any(|s| s.memories.contains(&memory))
    }

    fn command_buffer_in_flight(&self, command_buffer: CommandBufferHandle) -> bool {
        self.pending
            .iter()
            .any(|s| s.command_buffers.contains(&command_buffer))
    }

    fn descriptor_set_in_flight(&self, set: DescriptorSetHandle) -> bool {
        self.pending.iter().any(|s| s.descriptor_sets.contains(&set))
    }

    fn record(&mut self, command_buffer: CommandBufferHandle, command: Command) {
        let state = self.command_buffers.get(&command_buffer).map(|cb| cb.state);
        match state {
            Some(RecordState::Recording) => {
                if let Some(cb) = self.command_buffers.get_mut(&command_buffer) {
                    cb.commands.push(command);
                }
            }
            Some(_) => self.violation(format!(
                "command recorded into {command_buffer:?} outside of begin/end"
            )),
            None => self.violation(format!("command recorded into unknown {command_buffer:?}")),
        }
    }

    fn complete_front(&mut self) {
        if let Some(done) = self.pending.pop_front() {
            if let Some(fence) = done.fence {
                self.fences.insert(fence, FenceState::Signaled);
            }
        }
    }

    fn reference_buffer(&self, submission: &mut Submission, buffer: BufferHandle) {
        submission.buffers.insert(buffer);
        if let Some((memory, _)) = self.buffers.get(&buffer).and_then(|b| b.binding) {
            submission.memories.insert(memory);
        }
    }

    fn execute_copy(&mut self, src: BufferHandle, dst: BufferHandle, region: BufferCopy) {
        let bound = |device: &Self, buffer: BufferHandle, offset: u64| {
            let b = device.buffers.get(&buffer)?;
            if offset + region.size > b.size {
                return None;
            }
            b.binding.map(|(memory, base)| (memory, base + offset))
        };
        let (Some((src_mem, src_off)), Some((dst_mem, dst_off))) = (
            bound(self, src, region.src_offset),
            bound(self, dst, region.dst_offset),
        ) else {
            self.violation(format!("invalid copy {src:?} -> {dst:?} ({region:?})"));
            return;
        };

        let bytes = match self.memories.get_mut(&src_mem) {
            Some(mem) => mem.storage_mut().read(src_off as usize, region.size as usize),
            None => return,
        };
        if let Some(mem) = self.memories.get_mut(&dst_mem) {
            mem.storage_mut().write(dst_off as usize, &bytes);
        }
        self.stats.copies += 1;
        self.stats.bytes_copied += region.size;
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn find_memory_type(&self, type_bits: u32, required: MemoryProperties) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .find(|(i, props)| type_bits & (1 << i) != 0 && props.contains(required))
            .map(|(i, _)| i as u32)
    }

    fn allocate_memory(&mut self, size: u64, memory_type_index: u32) -> DeviceResult<MemoryHandle> {
        if memory_type_index as usize >= self.memory_types.len() {
            return Err(DeviceError::InvalidUsage(format!(
                "memory type {memory_type_index} does not exist"
            )));
        }
        if let Some(budget) = self.memory_budget {
            if self.allocated_bytes + size > budget {
                return Err(DeviceError::OutOfDeviceMemory);
            }
        }
        let handle = MemoryHandle(self.next_handle());
        self.memories.insert(
            handle,
            Memory {
                size,
                type_index: memory_type_index,
                storage: None,
                mapped: false,
            },
        );
        self.allocated_bytes += size;
        self.stats.memory_allocations += 1;
        Ok(handle)
    }

    fn free_memory(&mut self, memory: MemoryHandle) {
        if self.memory_in_flight(memory) {
            self.violation(format!("{memory:?} freed while in use by the GPU"));
        }
        match self.memories.remove(&memory) {
            Some(mem) => self.allocated_bytes -= mem.size,
            None => self.violation(format!("free of unknown {memory:?}")),
        }
    }

    fn map_memory(&mut self, memory: MemoryHandle) -> DeviceResult<NonNull<u8>> {
        let host_visible = {
            let mem = self.memories.get(&memory).ok_or(DeviceError::InvalidHandle {
                kind: "memory",
                id: memory.raw(),
            })?;
            self.memory_types[mem.type_index as usize].contains(MemoryProperties::HOST_VISIBLE)
        };
        if !host_visible {
            return Err(DeviceError::MapFailed(memory.raw()));
        }
        let mem = self
            .memories
            .get_mut(&memory)
            .ok_or(DeviceError::MapFailed(memory.raw()))?;
        mem.mapped = true;
        Ok(mem.storage_mut().ptr)
    }

    fn unmap_memory(&mut self, memory: MemoryHandle) {
        if let Some(mem) = self.memories.get_mut(&memory) {
            mem.mapped = false;
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferHandle> {
        if desc.size == 0 {
            return Err(DeviceError::InvalidUsage("zero-sized buffer".into()));
        }
        let handle = BufferHandle(self.next_handle());
        self.buffers.insert(
            handle,
            Buffer {
                size: desc.size,
                usage: desc.usage,
                binding: None,
            },
        );
        Ok(handle)
    }

    fn buffer_requirements(&self, buffer: BufferHandle) -> DeviceResult<MemoryRequirements> {
        let buf = self.buffers.get(&buffer).ok_or(DeviceError::InvalidHandle {
            kind: "buffer",
            id: buffer.raw(),
        })?;
        let alignment = if buf.usage.contains(wgpu::BufferUsages::UNIFORM) {
            self.limits.min_uniform_buffer_offset_alignment
        } else {
            BUFFER_ALIGNMENT
        };
        Ok(MemoryRequirements {
            size: align_up(buf.size, alignment),
            alignment,
            memory_type_bits: self.type_mask(|_| true),
        })
    }

    fn bind_buffer_memory(
        &mut self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> DeviceResult<()> {
        let requirements = self.buffer_requirements(buffer)?;
        let mem = self.memories.get(&memory).ok_or(DeviceError::InvalidHandle {
            kind: "memory",
            id: memory.raw(),
        })?;
        if offset % requirements.alignment != 0 || offset + requirements.size > mem.size {
            return Err(DeviceError::InvalidUsage(format!(
                "{buffer:?} does not fit {memory:?} at offset {offset}"
            )));
        }
        if let Some(buf) = self.buffers.get_mut(&buffer) {
            buf.binding = Some((memory, offset));
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffer_in_flight(buffer) {
            self.violation(format!("{buffer:?} destroyed while in use by the GPU"));
        }
        if self.buffers.remove(&buffer).is_none() {
            self.violation(format!("destroy of unknown {buffer:?}"));
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> DeviceResult<ImageHandle> {
        if desc.size.width == 0 || desc.size.height == 0 {
            return Err(DeviceError::InvalidUsage("zero-sized image".into()));
        }
        let texel = desc.format.block_copy_size(None).unwrap_or(4) as u64;
        let bytes = texel * desc.size.width as u64 * desc.size.height as u64;
        let requirements = MemoryRequirements {
            size: align_up(bytes, IMAGE_ALIGNMENT),
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: self.type_mask(|p| p.contains(MemoryProperties::DEVICE_LOCAL)),
        };
        let handle = ImageHandle(self.next_handle());
        self.images.insert(
            handle,
            Image {
                requirements,
                binding: None,
            },
        );
        Ok(handle)
    }

    fn image_requirements(&self, image: ImageHandle) -> DeviceResult<MemoryRequirements> {
        self.images
            .get(&image)
            .map(|i| i.requirements)
            .ok_or(DeviceError::InvalidHandle {
                kind: "image",
                id: image.raw(),
            })
    }

    fn bind_image_memory(
        &mut self,
        image: ImageHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> DeviceResult<()> {
        let requirements = self.image_requirements(image)?;
        let mem = self.memories.get(&memory).ok_or(DeviceError::InvalidHandle {
            kind: "memory",
            id: memory.raw(),
        })?;
        if offset % requirements.alignment != 0 || offset + requirements.size > mem.size {
            return Err(DeviceError::InvalidUsage(format!(
                "{image:?} does not fit {memory:?} at offset {offset}"
            )));
        }
        if let Some(img) = self.images.get_mut(&image) {
            img.binding = Some((memory, offset));
        }
        Ok(())
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if self.images.remove(&image).is_none() {
            self.violation(format!("destroy of unknown {image:?}"));
        }
    }

    fn allocate_command_buffer(&mut self) -> DeviceResult<CommandBufferHandle> {
        let handle = CommandBufferHandle(self.next_handle());
        self.command_buffers.insert(
            handle,
            CommandBuffer {
                state: RecordState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn free_command_buffer(&mut self, command_buffer: CommandBufferHandle) {
        if self.command_buffer_in_flight(command_buffer) {
            self.violation(format!("{command_buffer:?} freed while pending"));
        }
        self.command_buffers.remove(&command_buffer);
    }

    fn begin_command_buffer(&mut self, command_buffer: CommandBufferHandle) -> DeviceResult<()> {
        if self.command_buffer_in_flight(command_buffer) {
            self.violation(format!("{command_buffer:?} re-recorded while pending"));
            return Err(DeviceError::InvalidUsage(format!(
                "{command_buffer:?} is still pending"
            )));
        }
        let cb = self
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(DeviceError::InvalidHandle {
                kind: "command buffer",
                id: command_buffer.raw(),
            })?;
        cb.commands.clear();
        cb.state = RecordState::Recording;
        Ok(())
    }

    fn end_command_buffer(&mut self, command_buffer: CommandBufferHandle) -> DeviceResult<()> {
        let cb = self
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(DeviceError::InvalidHandle {
                kind: "command buffer",
                id: command_buffer.raw(),
            })?;
        if cb.state != RecordState::Recording {
            return Err(DeviceError::InvalidUsage(format!(
                "{command_buffer:?} ended without begin"
            )));
        }
        cb.state = RecordState::Executable;
        Ok(())
    }

    fn cmd_copy_buffer(
        &mut self,
        command_buffer: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) {
        self.record(
            command_buffer,
            Command::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        _offset: u64,
    ) {
        self.record(command_buffer, Command::BindVertexBuffer(buffer));
    }

    fn cmd_bind_index_buffer(
        &mut self,
        command_buffer: CommandBufferHandle,
        buffer: BufferHandle,
        _offset: u64,
    ) {
        self.record(command_buffer, Command::BindIndexBuffer(buffer));
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        command_buffer: CommandBufferHandle,
        set: DescriptorSetHandle,
        dynamic_offset: u32,
    ) {
        let target = self.descriptor_sets.get(&set).and_then(|s| s.target);
        if let Some((buffer, offset, range)) = target {
            let start = offset + u64::from(dynamic_offset);
            let size = self.buffers.get(&buffer).map_or(0, |b| b.size);
            if start + range > size {
                self.violation(format!(
                    "{set:?} binds [{start}, {}) past the end of {buffer:?} ({size} bytes)",
                    start + range
                ));
            }
        }
        self.record(command_buffer, Command::BindDescriptorSet(set));
    }

    fn cmd_draw_indexed(
        &mut self,
        command_buffer: CommandBufferHandle,
        _index_count: u32,
        _instance_count: u32,
    ) {
        self.record(command_buffer, Command::DrawIndexed);
    }

    fn submit(&mut self, submit: &SubmitInfo<'_>) -> DeviceResult<()> {
        if self.lost_submits > 0 {
            self.lost_submits -= 1;
            return Err(DeviceError::DeviceLost);
        }
        if let Some(fence) = submit.fence {
            match self.fences.get(&fence) {
                Some(FenceState::Unsignaled) => {}
                Some(_) => {
                    return Err(DeviceError::InvalidUsage(format!(
                        "{fence:?} submitted without being reset"
                    )))
                }
                None => {
                    return Err(DeviceError::InvalidHandle {
                        kind: "fence",
                        id: fence.raw(),
                    })
                }
            }
        }
        for semaphore in submit.wait_semaphores.iter().chain(submit.signal_semaphores) {
            if !self.semaphores.contains(semaphore) {
                return Err(DeviceError::InvalidHandle {
                    kind: "semaphore",
                    id: semaphore.raw(),
                });
            }
        }

        let mut submission = Submission {
            fence: submit.fence,
            ..Submission::default()
        };
        let mut work = Vec::new();
        for &handle in submit.command_buffers {
            let cb = self
                .command_buffers
                .get(&handle)
                .ok_or(DeviceError::InvalidHandle {
                    kind: "command buffer",
                    id: handle.raw(),
                })?;
            if cb.state != RecordState::Executable {
                return Err(DeviceError::InvalidUsage(format!(
                    "{handle:?} submitted while not executable"
                )));
            }
            submission.command_buffers.insert(handle);
            work.extend(cb.commands.iter().cloned());
        }

        for command in work {
            match command {
                Command::CopyBuffer { src, dst, regions } => {
                    self.reference_buffer(&mut submission, src);
                    self.reference_buffer(&mut submission, dst);
                    for region in regions {
                        self.execute_copy(src, dst, region);
                    }
                }
                Command::BindVertexBuffer(buffer) | Command::BindIndexBuffer(buffer) => {
                    if !self.buffers.contains_key(&buffer) {
                        self.violation(format!("bound destroyed {buffer:?}"));
                    }
                    self.reference_buffer(&mut submission, buffer);
                }
                Command::BindDescriptorSet(set) => {
                    submission.descriptor_sets.insert(set);
                    match self.descriptor_sets.get(&set).and_then(|s| s.target) {
                        Some((buffer, _, _)) => self.reference_buffer(&mut submission, buffer),
                        None => self.violation(format!("bound unwritten or destroyed {set:?}")),
                    }
                }
                Command::DrawIndexed => self.stats.draws += 1,
            }
        }

        if let Some(fence) = submit.fence {
            self.fences.insert(fence, FenceState::Pending);
        }
        self.pending.push_back(submission);
        self.stats.submissions += 1;
        Ok(())
    }

    fn queue_wait_idle(&mut self) -> DeviceResult<()> {
        while !self.pending.is_empty() {
            self.complete_front();
        }
        Ok(())
    }

    fn create_fence(&mut self, signaled: bool) -> DeviceResult<FenceHandle> {
        let handle = FenceHandle(self.next_handle());
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        self.fences.insert(handle, state);
        Ok(handle)
    }

    fn wait_for_fence(&mut self, fence: FenceHandle, _timeout_ns: u64) -> DeviceResult<()> {
        match self.fences.get(&fence) {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) => {
                // single in-order queue: everything up to this submission is done
                while let Some(front) = self.pending.front() {
                    let done = front.fence == Some(fence);
                    self.complete_front();
                    if done {
                        break;
                    }
                }
                Ok(())
            }
            // nothing will ever signal it
            Some(FenceState::Unsignaled) => Err(DeviceError::Timeout),
            None => Err(DeviceError::InvalidHandle {
                kind: "fence",
                id: fence.raw(),
            }),
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> DeviceResult<()> {
        match self.fences.get(&fence).copied() {
            Some(FenceState::Signaled | FenceState::Unsignaled) => {
                self.fences.insert(fence, FenceState::Unsignaled);
                Ok(())
            }
            Some(FenceState::Pending) => Err(DeviceError::InvalidUsage(format!(
                "{fence:?} reset while pending"
            ))),
            None => Err(DeviceError::InvalidHandle {
                kind: "fence",
                id: fence.raw(),
            }),
        }
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if self.fences.get(&fence) == Some(&FenceState::Pending) {
            self.violation(format!("{fence:?} destroyed while pending"));
        }
        self.fences.remove(&fence);
    }

    fn create_semaphore(&mut self) -> DeviceResult<SemaphoreHandle> {
        let handle = SemaphoreHandle(self.next_handle());
        self.semaphores.insert(handle);
        Ok(handle)
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.semaphores.remove(&semaphore);
    }

    fn allocate_descriptor_set(
        &mut self,
        _layout: DescriptorSetLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle> {
        let handle = DescriptorSetHandle(self.next_handle());
        self.descriptor_sets.insert(handle, DescriptorSet { target: None });
        Ok(handle)
    }

    fn write_uniform_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        _binding: u32,
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    ) {
        if self.descriptor_set_in_flight(set) {
            self.violation(format!("{set:?} rewritten while in use by the GPU"));
        }
        match self.descriptor_sets.get_mut(&set) {
            Some(s) => s.target = Some((buffer, offset, range)),
            None => self.violation(format!("write to unknown {set:?}")),
        }
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetHandle) {
        if self.descriptor_set_in_flight(set) {
            self.violation(format!("{set:?} freed while in use by the GPU"));
        }
        if self.descriptor_sets.remove(&set).is_none() {
            self.violation(format!("free of unknown {set:?}"));
        }
    }
}

/// Scripted presentation surface with round-robin image indices.
pub struct HeadlessSurface {
    extent: PhysicalSize<u32>,
    image_count: u32,
    next_image: u32,
    stale_acquires: u32,
    present_script: VecDeque<PresentOutcome>,
    recreations: u32,
}

impl HeadlessSurface {
    pub fn new(extent: PhysicalSize<u32>, image_count: u32) -> Self {
        Self {
            extent,
            image_count: image_count.max(1),
            next_image: 0,
            stale_acquires: 0,
            present_script: VecDeque::new(),
            recreations: 0,
        }
    }

    /// The next `count` acquisitions report the chain as out of date.
    pub fn fail_next_acquires(&mut self, count: u32) {
        self.stale_acquires += count;
    }

    /// Queue an outcome for an upcoming present.
    pub fn script_present(&mut self, outcome: PresentOutcome) {
        self.present_script.push_back(outcome);
    }

    pub fn recreations(&self) -> u32 {
        self.recreations
    }
}

impl<D: GpuDevice> PresentationSurface<D> for HeadlessSurface {
    fn extent(&self) -> PhysicalSize<u32> {
        self.extent
    }

    fn acquire_next_image(
        &mut self,
        _device: &mut D,
        _signal: SemaphoreHandle,
        _timeout_ns: u64,
    ) -> DeviceResult<AcquireOutcome> {
        if self.stale_acquires > 0 {
            self.stale_acquires -= 1;
            return Ok(AcquireOutcome::OutOfDate);
        }
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn present(
        &mut self,
        _device: &mut D,
        image_index: u32,
        _wait: SemaphoreHandle,
    ) -> DeviceResult<PresentOutcome> {
        if image_index >= self.image_count {
            return Err(DeviceError::InvalidUsage(format!(
                "image {image_index} out of range"
            )));
        }
        Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }

    fn recreate(&mut self, _device: &mut D, extent: PhysicalSize<u32>) -> DeviceResult<()> {
        self.extent = extent;
        self.next_image = 0;
        self.recreations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_buffer(
        device: &mut HeadlessDevice,
        size: u64,
        props: MemoryProperties,
    ) -> BufferHandle {
        let buffer = device
            .create_buffer(&BufferDesc {
                label: None,
                size,
                usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            })
            .unwrap();
        let req = device.buffer_requirements(buffer).unwrap();
        let ty = device.find_memory_type(req.memory_type_bits, props).unwrap();
        let memory = device.allocate_memory(req.size, ty).unwrap();
        device.bind_buffer_memory(buffer, memory, 0).unwrap();
        buffer
    }

    #[test]
    fn memory_type_query_respects_bits() {
        let device = HeadlessDevice::new();
        assert_eq!(device.find_memory_type(!0, MemoryProperties::DEVICE_LOCAL), Some(0));
        assert_eq!(device.find_memory_type(0b1110, MemoryProperties::DEVICE_LOCAL), Some(3));
        assert_eq!(device.find_memory_type(0b0001, MemoryProperties::HOST_VISIBLE), None);
    }

    #[test]
    fn device_local_memory_cannot_be_mapped() {
        let mut device = HeadlessDevice::new();
        let memory = device.allocate_memory(1024, 0).unwrap();
        assert_eq!(device.map_memory(memory), Err(DeviceError::MapFailed(memory.raw())));
    }

    #[test]
    fn copy_executes_on_submit() {
        let mut device = HeadlessDevice::new();
        let host = MemoryProperties::HOST_VISIBLE;
        let src = bound_buffer(&mut device, 64, host);
        let dst = bound_buffer(&mut device, 64, MemoryProperties::DEVICE_LOCAL);

        let (memory, _) = device.buffers[&src].binding.unwrap();
        let ptr = device.map_memory(memory).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([7u8; 8].as_ptr(), ptr.as_ptr(), 8) };

        let cb = device.allocate_command_buffer().unwrap();
        device.begin_command_buffer(cb).unwrap();
        device.cmd_copy_buffer(
            cb,
            src,
            dst,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 8,
                size: 8,
            }],
        );
        device.end_command_buffer(cb).unwrap();
        device
            .submit(&SubmitInfo {
                command_buffers: &[cb],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(device.read_buffer(dst, 8, 8).unwrap(), vec![7u8; 8]);
        assert_eq!(device.read_buffer(dst, 0, 8).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn destroying_in_flight_buffer_is_a_violation() {
        let mut device = HeadlessDevice::new();
        let buffer = bound_buffer(&mut device, 64, MemoryProperties::DEVICE_LOCAL);
        let fence = device.create_fence(false).unwrap();
        let cb = device.allocate_command_buffer().unwrap();
        device.begin_command_buffer(cb).unwrap();
        device.cmd_bind_vertex_buffer(cb, buffer, 0);
        device.end_command_buffer(cb).unwrap();
        device
            .submit(&SubmitInfo {
                command_buffers: &[cb],
                fence: Some(fence),
                ..Default::default()
            })
            .unwrap();

        device.destroy_buffer(buffer);
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn waiting_on_fence_releases_earlier_submissions() {
        let mut device = HeadlessDevice::new();
        let fences = [device.create_fence(false).unwrap(), device.create_fence(false).unwrap()];
        for fence in fences {
            device
                .submit(&SubmitInfo {
                    fence: Some(fence),
                    ..Default::default()
                })
                .unwrap();
        }
        assert_eq!(device.in_flight_submissions(), 2);
        device.wait_for_fence(fences[1], WAIT_FOREVER).unwrap();
        assert_eq!(device.in_flight_submissions(), 0);
        device.wait_for_fence(fences[0], WAIT_FOREVER).unwrap();
    }

    #[test]
    fn waiting_on_unsubmitted_fence_times_out() {
        let mut device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert_eq!(device.wait_for_fence(fence, WAIT_FOREVER), Err(DeviceError::Timeout));
    }

    #[test]
    fn surface_script_reports_out_of_date() {
        let mut device = HeadlessDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        let mut surface = HeadlessSurface::new(PhysicalSize::new(640, 480), 3);
        surface.fail_next_acquires(1);

        let first = surface.acquire_next_image(&mut device, semaphore, WAIT_FOREVER).unwrap();
        assert_eq!(first, AcquireOutcome::OutOfDate);
        let second = surface.acquire_next_image(&mut device, semaphore, WAIT_FOREVER).unwrap();
        assert_eq!(second, AcquireOutcome::Acquired { image_index: 0, suboptimal: false });
    }
}
