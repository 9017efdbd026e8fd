// Device memory allocation
//
// Austin Shafer - 2024
use ash::vk;

use crate::error::{vk_err, Result, SquallError};
use utils::log;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Find a memory type in `props` that is suitable for `reqs` and has
/// every flag in `flags`
///
/// Memory types specify the location and accessability of memory. Device
/// local memory is resident on the GPU, while host visible memory can be
/// read from the system side.
pub fn find_memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    reqs: &vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = (props.memory_type_count as usize).min(props.memory_types.len());
    for (i, mem_type) in props.memory_types[..count].iter().enumerate() {
        // Bit i of memoryTypeBits will be set if the resource supports
        // the ith memory type in props.
        if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
            return Some(i as u32);
        }
    }
    None
}

/// Running totals for one allocator
#[derive(Default)]
struct AllocStats {
    as_bytes: AtomicU64,
    as_count: AtomicU64,
}

impl AllocStats {
    fn add(&self, size: u64) {
        self.as_bytes.fetch_add(size, Ordering::Relaxed);
        self.as_count.fetch_add(1, Ordering::Relaxed);
    }

    fn sub(&self, size: u64) {
        self.as_bytes.fetch_sub(size, Ordering::Relaxed);
        self.as_count.fetch_sub(1, Ordering::Relaxed);
    }

    fn bytes(&self) -> u64 {
        self.as_bytes.load(Ordering::Relaxed)
    }

    fn count(&self) -> u64 {
        self.as_count.load(Ordering::Relaxed)
    }
}

/// Per-device memory allocator
///
/// This is a thin layer over vkAllocateMemory. Every allocation is
/// dedicated, the allocator only picks memory types and keeps track of
/// how much is live.
pub struct MemAllocator {
    ma_dev: ash::Device,
    ma_props: vk::PhysicalDeviceMemoryProperties,
    ma_stats: Arc<AllocStats>,
}

impl MemAllocator {
    pub fn new(dev: &ash::Device, props: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            ma_dev: dev.clone(),
            ma_props: props,
            ma_stats: Arc::new(AllocStats::default()),
        }
    }

    /// Bytes currently allocated through this allocator
    pub fn allocated_bytes(&self) -> u64 {
        self.ma_stats.bytes()
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> u64 {
        self.ma_stats.count()
    }

    fn allocate(
        &self,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let index = find_memory_type_index(&self.ma_props, reqs, flags)
            .ok_or(SquallError::NO_MEMORY_TYPE)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(index);

        let memory = unsafe {
            self.ma_dev
                .allocate_memory(&alloc_info, None)
                .map_err(vk_err("vkAllocateMemory"))?
        };
        self.ma_stats.add(reqs.size);

        Ok(memory)
    }

    /// Allocates a buffer and memory to back it
    ///
    /// The contents are undefined.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<GpuBuffer> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.ma_dev
                .create_buffer(&create_info, None)
                .map_err(vk_err("vkCreateBuffer"))?
        };
        let reqs = unsafe { self.ma_dev.get_buffer_memory_requirements(buffer) };

        let memory = match self.allocate(&reqs, flags) {
            Ok(m) => m,
            Err(e) => {
                unsafe { self.ma_dev.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        // Construct this now so the error path below frees everything
        let ret = GpuBuffer {
            b_dev: self.ma_dev.clone(),
            b_buffer: buffer,
            b_memory: memory,
            b_size: reqs.size,
            b_stats: self.ma_stats.clone(),
        };

        unsafe {
            self.ma_dev
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(vk_err("vkBindBufferMemory"))?
        };

        log::debug!("Allocated buffer of {} bytes ({:?})", reqs.size, usage);
        Ok(ret)
    }

    /// Allocates a host visible buffer and fills it with `data`
    pub fn create_buffer_with_data<T: Copy>(
        &self,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<GpuBuffer> {
        let size = std::mem::size_of_val(data) as u64;
        let buf = self.create_buffer(
            size.max(1),
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buf.write(0, data)?;
        Ok(buf)
    }
}

/// A buffer and the memory backing it
///
/// Both are released when this is dropped. Buffers in use by the GPU
/// should be handed to the reclaimer instead of being dropped directly.
pub struct GpuBuffer {
    b_dev: ash::Device,
    b_buffer: vk::Buffer,
    b_memory: vk::DeviceMemory,
    b_size: u64,
    b_stats: Arc<AllocStats>,
}

impl GpuBuffer {
    pub fn buffer(&self) -> vk::Buffer {
        self.b_buffer
    }

    pub fn size(&self) -> u64 {
        self.b_size
    }

    /// Writes `data` at `offset`
    ///
    /// Memory needs to be host visible and coherent. This does not flush
    /// after writing.
    pub fn write<T: Copy>(&self, offset: u64, data: &[T]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let data_size = std::mem::size_of_val(data) as u64;
        unsafe {
            let ptr = self
                .b_dev
                .map_memory(self.b_memory, offset, data_size, vk::MemoryMapFlags::empty())
                .map_err(vk_err("vkMapMemory"))?;

            let dst = std::slice::from_raw_parts_mut(ptr as *mut T, data.len());
            dst.copy_from_slice(data);

            self.b_dev.unmap_memory(self.b_memory);
        }
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.b_dev.destroy_buffer(self.b_buffer, None);
            self.b_dev.free_memory(self.b_memory, None);
        }
        self.b_stats.sub(self.b_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut ret = vk::PhysicalDeviceMemoryProperties::default();
        ret.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            ret.memory_types[i].property_flags = *flags;
        }
        ret
    }

    fn reqs(bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 256,
            alignment: 16,
            memory_type_bits: bits,
        }
    }

    #[test]
    fn picks_first_matching_type() {
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let p = props(&[local, host, local | host]);

        assert_eq!(find_memory_type_index(&p, &reqs(0b111), local), Some(0));
        assert_eq!(find_memory_type_index(&p, &reqs(0b111), host), Some(1));
        assert_eq!(find_memory_type_index(&p, &reqs(0b111), local | host), Some(2));
    }

    #[test]
    fn respects_type_bits() {
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let p = props(&[local, local]);

        assert_eq!(find_memory_type_index(&p, &reqs(0b10), local), Some(1));
        assert_eq!(find_memory_type_index(&p, &reqs(0b100), local), None);
        assert_eq!(
            find_memory_type_index(&p, &reqs(0b11), vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn stats_follow_allocations() {
        let stats = Arc::new(AllocStats::default());
        let buffers = stats.clone();

        buffers.add(256);
        buffers.add(4096);
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.bytes(), 4352);

        buffers.sub(256);
        assert_eq!(stats.count(), 1);
        assert_eq!(stats.bytes(), 4096);

        buffers.sub(4096);
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.bytes(), 0);
    }
}
