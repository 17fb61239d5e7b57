use std::marker::PhantomData;
use std::sync::Mutex;
use ash::vk;
use bytemuck::Pod;
use color_eyre::eyre::{eyre, OptionExt, Result};
use gpu_allocator::MemoryLocation;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::device_ctx::queue::QueueRole;
use crate::renderer::resources::buffer::Buffer;

/// Location of one cell handed out by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolAllocation {
    pub buffer_index: usize,
    pub cell_index: usize,
    pub offset: u64,
    pub size: u64,
}

struct PoolSlot<B, const CELLS: usize> {
    payload: B,
    cells: [bool; CELLS],
    first_free_cell: usize,
    free_on_next_collection: bool,
}

impl<B, const CELLS: usize> PoolSlot<B, CELLS> {
    fn new(payload: B) -> Self {
        Self {
            payload,
            cells: [false; CELLS],
            first_free_cell: 0,
            free_on_next_collection: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.cells.iter().all(|used| !used)
    }
}

/// Cell bookkeeping for a pool of physical buffers holding `CELLS` cells each.
/// Destroyed buffers leave a hole in the list that the next new buffer fills.
pub struct PoolLedger<B, const CELLS: usize> {
    slots: Vec<Option<PoolSlot<B, CELLS>>>,
    first_free_slot: usize,
}

impl<B, const CELLS: usize> Default for PoolLedger<B, CELLS> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            first_free_slot: 0,
        }
    }
}

impl<B, const CELLS: usize> PoolLedger<B, CELLS> {
    /// Occupies the first free cell, creating a buffer through `make` when every live one is full.
    /// Returns `(buffer_index, cell_index)`.
    pub fn occupy(&mut self, make: impl FnOnce() -> Result<B>) -> Result<(usize, usize)> {
        let (buffer_index, cell_index) = match self.find_free_cell() {
            Some(found) => found,
            None => {
                let payload = make()?;
                let index = self.insert(payload);
                (index, 0)
            }
        };

        let Some(slot) = self.slots[buffer_index].as_mut() else {
            return Err(eyre!("Pool slot {} vanished during allocation", buffer_index));
        };
        slot.cells[cell_index] = true;
        slot.free_on_next_collection = false;

        slot.first_free_cell = cell_index + 1;
        self.first_free_slot = if slot.first_free_cell < CELLS {
            buffer_index
        } else {
            buffer_index + 1
        };

        Ok((buffer_index, cell_index))
    }

    /// Occupies a cell of `cell_size` bytes and hands it to `fill` along with its buffer.
    /// The cell is released again when `fill` fails.
    pub fn allocate_cell(
        &mut self,
        cell_size: u64,
        make: impl FnOnce() -> Result<B>,
        fill: impl FnOnce(&B, &BufferPoolAllocation) -> Result<()>,
    ) -> Result<BufferPoolAllocation> {
        let (buffer_index, cell_index) = self.occupy(make)?;
        let allocation = BufferPoolAllocation {
            buffer_index,
            cell_index,
            offset: cell_index as u64 * cell_size,
            size: cell_size,
        };

        let filled = match self.get(buffer_index) {
            Some(buffer) => fill(buffer, &allocation),
            None => Err(eyre!("Pool buffer {} does not exist", buffer_index)),
        };
        if let Err(e) = filled {
            self.release(buffer_index, cell_index);
            return Err(e);
        }
        Ok(allocation)
    }

    pub fn release(&mut self, buffer_index: usize, cell_index: usize) {
        if let Some(Some(slot)) = self.slots.get_mut(buffer_index) {
            if let Some(cell) = slot.cells.get_mut(cell_index) {
                *cell = false;
                slot.first_free_cell = slot.first_free_cell.min(cell_index);
            }
        }
        self.first_free_slot = self.first_free_slot.min(buffer_index);
    }

    /// Marks empty buffers on their first empty observation and hands back
    /// the ones that were already marked, for the caller to destroy
    pub fn collect_garbage(&mut self) -> Vec<B> {
        self.first_free_slot = 0;

        let mut destroyed = Vec::new();
        for entry in self.slots.iter_mut().rev() {
            let Some(slot) = entry.as_mut() else {
                continue;
            };
            if slot.free_on_next_collection {
                if let Some(slot) = entry.take() {
                    destroyed.push(slot.payload);
                }
            } else if slot.is_empty() {
                slot.free_on_next_collection = true;
            }
        }
        destroyed
    }

    pub fn drain(&mut self) -> Vec<B> {
        self.first_free_slot = 0;
        self.slots
            .drain(..)
            .flatten()
            .map(|slot| slot.payload)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn get(&self, buffer_index: usize) -> Option<&B> {
        self.slots
            .get(buffer_index)
            .and_then(|slot| slot.as_ref())
            .map(|slot| &slot.payload)
    }

    fn find_free_cell(&self) -> Option<(usize, usize)> {
        self.slots
            .iter()
            .enumerate()
            .skip(self.first_free_slot)
            .find_map(|(buffer_index, slot)| {
                let slot = slot.as_ref()?;
                (slot.first_free_cell..CELLS)
                    .find(|cell| !slot.cells[*cell])
                    .map(|cell| (buffer_index, cell))
            })
    }

    fn insert(&mut self, payload: B) -> usize {
        match self.slots.iter().position(|slot| slot.is_none()) {
            Some(index) => {
                self.slots[index] = Some(PoolSlot::new(payload));
                index
            }
            None => {
                self.slots.push(Some(PoolSlot::new(payload)));
                self.slots.len() - 1
            }
        }
    }
}

/// Sub-allocates same-size device-local cells of `T` from buffers holding `CELLS` cells each.
/// Data reaches a cell through a lazily created staging buffer and a single-time copy.
pub struct DeviceLocalBufferPool<T: Pod, const CELLS: usize> {
    name: String,
    usage: vk::BufferUsageFlags,
    ledger: PoolLedger<Buffer, CELLS>,
    staging: Option<Buffer>,
    _marker: PhantomData<T>,
}

impl<T: Pod, const CELLS: usize> DeviceLocalBufferPool<T, CELLS> {
    pub const CELL_SIZE: u64 = size_of::<T>() as u64;

    pub fn new(name: &str, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name: name.into(),
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            ledger: PoolLedger::default(),
            staging: None,
            _marker: PhantomData,
        }
    }

    pub fn allocate(
        &mut self,
        dev: &RenderDevice,
        role: QueueRole,
        data: &T,
    ) -> Result<BufferPoolAllocation> {
        let name = &self.name;
        let usage = self.usage;
        let staging = &mut self.staging;
        self.ledger.allocate_cell(
            Self::CELL_SIZE,
            || {
                let mut buffer = Buffer::new(name, usage, Self::CELL_SIZE * CELLS as u64);
                buffer.allocate(dev, MemoryLocation::GpuOnly, false)?;
                log::debug!("Pool '{}' created a buffer of {} cells", name, CELLS);
                Ok(buffer)
            },
            |dst, allocation| {
                let staging = Self::staging_buffer(staging, dev, name)?;
                staging.write_to_mapped_data(bytemuck::bytes_of(data), 0)?;
                staging.flush(dev)?;

                let staging = &*staging;
                dev.single_time_commands(role, |cmd, device| {
                    Buffer::copy(device, cmd, staging, dst, 0, allocation.offset, allocation.size)
                })
            },
        )
    }

    pub fn free(&mut self, allocation: &BufferPoolAllocation) {
        self.ledger.release(allocation.buffer_index, allocation.cell_index);
    }

    pub fn collect_garbage(&mut self) {
        for mut buffer in self.ledger.collect_garbage() {
            log::debug!("Pool '{}' destroyed an empty buffer", self.name);
            buffer.free();
        }
    }

    pub fn free_pool(&mut self) {
        if let Some(mut staging) = self.staging.take() {
            staging.unmap_memory();
            staging.free();
        }
        for mut buffer in self.ledger.drain() {
            buffer.free();
        }
    }

    /// Number of live physical buffers
    pub fn count(&self) -> usize {
        self.ledger.count()
    }

    pub fn buffer(&self, buffer_index: usize) -> Option<&Buffer> {
        self.ledger.get(buffer_index)
    }

    fn staging_buffer<'a>(
        staging: &'a mut Option<Buffer>,
        dev: &RenderDevice,
        name: &str,
    ) -> Result<&'a mut Buffer> {
        if staging.is_none() {
            let mut buffer = Buffer::new(
                &format!("{} staging", name),
                vk::BufferUsageFlags::TRANSFER_SRC,
                Self::CELL_SIZE,
            );
            buffer.allocate(dev, MemoryLocation::CpuToGpu, false)?;
            buffer.map_memory()?;
            *staging = Some(buffer);
        }
        staging.as_mut().ok_or_eyre("Pool staging buffer is missing")
    }
}

impl<T: Pod, const CELLS: usize> Drop for DeviceLocalBufferPool<T, CELLS> {
    fn drop(&mut self) {
        if self.ledger.count() > 0 {
            log::warn!("Pool '{}' dropped with {} live buffers", self.name, self.ledger.count());
        }
        self.free_pool();
    }
}

/// Pool shared between threads, every call serialized by an internal lock
pub struct SharedBufferPool<T: Pod, const CELLS: usize> {
    pool: Mutex<DeviceLocalBufferPool<T, CELLS>>,
}

impl<T: Pod, const CELLS: usize> SharedBufferPool<T, CELLS> {
    pub fn new(name: &str, usage: vk::BufferUsageFlags) -> Self {
        Self {
            pool: Mutex::new(DeviceLocalBufferPool::new(name, usage)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DeviceLocalBufferPool<T, CELLS>>> {
        self.pool.lock().map_err(|e| eyre!(e.to_string()))
    }

    pub fn allocate(
        &self,
        dev: &RenderDevice,
        role: QueueRole,
        data: &T,
    ) -> Result<BufferPoolAllocation> {
        self.lock()?.allocate(dev, role, data)
    }

    pub fn free(&self, allocation: &BufferPoolAllocation) -> Result<()> {
        self.lock()?.free(allocation);
        Ok(())
    }

    pub fn collect_garbage(&self) -> Result<()> {
        self.lock()?.collect_garbage();
        Ok(())
    }

    pub fn free_pool(&self) -> Result<()> {
        self.lock()?.free_pool();
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.lock()?.count())
    }

    pub fn buffer_handle(&self, buffer_index: usize) -> Result<Option<vk::Buffer>> {
        Ok(self.lock()?.buffer(buffer_index).map(Buffer::handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn occupy_n<const CELLS: usize>(ledger: &mut PoolLedger<u32, CELLS>, n: usize, next_id: &mut u32) -> Vec<(usize, usize)> {
        (0..n)
            .map(|_| {
                ledger.occupy(|| {
                    *next_id += 1;
                    Ok(*next_id)
                }).unwrap()
            })
            .collect()
    }

    #[test]
    fn fifth_allocation_opens_second_buffer() {
        let mut ledger = PoolLedger::<u32, 4>::default();
        let mut ids = 0;
        let cells = occupy_n(&mut ledger, 5, &mut ids);
        assert_eq!(cells, vec![(0, 0), (0, 1), (0, 2), (0, 3), (1, 0)]);
        assert_eq!(ledger.count(), 2);
        assert_eq!(ids, 2);
    }

    #[test]
    fn live_cells_are_never_shared() {
        let mut ledger = PoolLedger::<u32, 3>::default();
        let mut ids = 0;
        let mut cells = occupy_n(&mut ledger, 7, &mut ids);
        ledger.release(cells[1].0, cells[1].1);
        ledger.release(cells[4].0, cells[4].1);
        cells.remove(4);
        cells.remove(1);
        cells.extend(occupy_n(&mut ledger, 4, &mut ids));

        let unique = cells.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), cells.len());
    }

    #[test]
    fn freed_cell_is_reused_first() {
        let mut ledger = PoolLedger::<u32, 4>::default();
        let mut ids = 0;
        occupy_n(&mut ledger, 6, &mut ids);
        ledger.release(0, 2);
        assert_eq!(occupy_n(&mut ledger, 1, &mut ids), vec![(0, 2)]);
        assert_eq!(occupy_n(&mut ledger, 1, &mut ids), vec![(1, 2)]);
    }

    #[test]
    fn empty_buffer_survives_one_collection() {
        let mut ledger = PoolLedger::<u32, 2>::default();
        let mut ids = 0;
        let cells = occupy_n(&mut ledger, 4, &mut ids);
        ledger.release(cells[2].0, cells[2].1);
        ledger.release(cells[3].0, cells[3].1);

        assert!(ledger.collect_garbage().is_empty());
        assert_eq!(ledger.count(), 2);

        assert_eq!(ledger.collect_garbage(), vec![2]);
        assert_eq!(ledger.count(), 1);
        assert!(ledger.get(1).is_none());
        assert_eq!(ledger.get(0), Some(&1));
    }

    #[test]
    fn allocation_between_collections_cancels_quarantine() {
        let mut ledger = PoolLedger::<u32, 2>::default();
        let mut ids = 0;
        occupy_n(&mut ledger, 1, &mut ids);
        ledger.release(0, 0);

        assert!(ledger.collect_garbage().is_empty());
        assert_eq!(occupy_n(&mut ledger, 1, &mut ids), vec![(0, 0)]);
        assert!(ledger.collect_garbage().is_empty());
        assert_eq!(ledger.count(), 1);
    }

    #[test]
    fn destroyed_slot_is_refilled_before_growing() {
        let mut ledger = PoolLedger::<u32, 1>::default();
        let mut ids = 0;
        occupy_n(&mut ledger, 3, &mut ids);
        ledger.release(1, 0);
        ledger.collect_garbage();
        ledger.collect_garbage();
        assert_eq!(ledger.count(), 2);

        assert_eq!(occupy_n(&mut ledger, 1, &mut ids), vec![(1, 0)]);
        assert_eq!(ledger.get(1), Some(&4));
        assert_eq!(ledger.count(), 3);
    }

    #[test]
    fn collection_resets_search_hint() {
        let mut ledger = PoolLedger::<u32, 2>::default();
        let mut ids = 0;
        occupy_n(&mut ledger, 4, &mut ids);
        assert_eq!(ledger.first_free_slot, 2);
        ledger.collect_garbage();
        assert_eq!(ledger.first_free_slot, 0);
        assert_eq!(occupy_n(&mut ledger, 1, &mut ids), vec![(2, 0)]);
    }

    #[test]
    fn failed_buffer_creation_leaves_ledger_untouched() {
        let mut ledger = PoolLedger::<u32, 2>::default();
        assert!(ledger.occupy(|| Err(eyre!("out of memory"))).is_err());
        assert_eq!(ledger.count(), 0);
    }

    #[test]
    fn drain_returns_every_live_buffer() {
        let mut ledger = PoolLedger::<u32, 1>::default();
        let mut ids = 0;
        occupy_n(&mut ledger, 3, &mut ids);
        ledger.release(0, 0);
        ledger.collect_garbage();
        ledger.collect_garbage();
        assert_eq!(ledger.drain(), vec![2, 3]);
        assert_eq!(ledger.count(), 0);
    }

    #[test]
    fn cells_map_to_byte_ranges() {
        let mut ledger = PoolLedger::<u32, 4>::default();
        let mut filled = Vec::new();
        let allocations = (0..5)
            .map(|i| {
                ledger.allocate_cell(
                    16,
                    || Ok(i),
                    |buffer, allocation| {
                        filled.push((*buffer, allocation.offset));
                        Ok(())
                    },
                ).unwrap()
            })
            .collect::<Vec<_>>();

        assert_eq!(
            allocations[3],
            BufferPoolAllocation { buffer_index: 0, cell_index: 3, offset: 48, size: 16 }
        );
        assert_eq!(
            allocations[4],
            BufferPoolAllocation { buffer_index: 1, cell_index: 0, offset: 0, size: 16 }
        );
        assert!(allocations.iter().all(|a| a.offset == a.cell_index as u64 * 16 && a.size == 16));
        assert_eq!(filled, vec![(0, 0), (0, 16), (0, 32), (0, 48), (4, 0)]);
    }

    #[test]
    fn failed_fill_releases_the_cell() {
        let mut ledger = PoolLedger::<u32, 2>::default();
        let failed = ledger.allocate_cell(8, || Ok(1), |_, _| Err(eyre!("copy failed")));
        assert!(failed.is_err());

        let allocation = ledger.allocate_cell(8, || Ok(2), |_, _| Ok(())).unwrap();
        assert_eq!((allocation.buffer_index, allocation.cell_index), (0, 0));
        assert_eq!(ledger.count(), 1);
    }
}
