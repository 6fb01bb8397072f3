//! Owning wrapper for a Vulkan buffer and its backing allocation.

use ash::vk;
use gpu_allocator::vulkan::Allocation;

use crate::device::Device;
use crate::error::{RenderError, RenderResult};

/// A GPU buffer with exclusive ownership of its backing memory.
///
/// All dynamic buffers in this tool are host-visible (CpuToGpu) so they can
/// be rewritten with a plain map/copy, skipping the staged device-local path.
/// Destruction is explicit via [`Buffer::destroy`]; there is no reference
/// counting.
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub(crate) allocation: Option<Allocation>,
    pub size: u64,
}

impl Default for Buffer {
    /// An unallocated placeholder; valid only as a slot to be replaced.
    fn default() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 0,
        }
    }
}

impl Buffer {
    /// Copy `data` into the mapped allocation at `offset`. The caller
    /// guarantees the buffer was sized to fit.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        if let Some(allocation) = self.allocation.as_mut() {
            if let Some(mapped) = allocation.mapped_slice_mut() {
                let start = offset as usize;
                let end = start + data.len();
                if end <= mapped.len() {
                    mapped[start..end].copy_from_slice(data);
                } else {
                    log::warn!(
                        "buffer write out of range: {}..{} into {} bytes",
                        start,
                        end,
                        mapped.len()
                    );
                }
            }
        }
    }

    /// Flush the mapped range. The memory is host-coherent so this is
    /// technically redundant, but bone uploads issue it explicitly anyway.
    pub fn flush(&self, device: &Device) -> RenderResult<()> {
        let Some(allocation) = self.allocation.as_ref() else {
            return Ok(());
        };
        let range = vk::MappedMemoryRange {
            memory: unsafe { allocation.memory() },
            offset: allocation.offset(),
            size: vk::WHOLE_SIZE,
            ..Default::default()
        };
        unsafe {
            device
                .device
                .flush_mapped_memory_ranges(&[range])
                .map_err(|e| RenderError::Submission(format!("flush failed: {e:?}")))
        }
    }

    /// Release the buffer and its allocation. Safe to call on a placeholder.
    pub fn destroy(&mut self, device: &Device) {
        if self.buffer != vk::Buffer::null() {
            unsafe { device.device.destroy_buffer(self.buffer, None) };
            self.buffer = vk::Buffer::null();
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = device.allocator().lock().free(allocation);
        }
        self.size = 0;
    }
}
