//! Per-context staging of dynamic views and the pool of tables they are committed into.
//!
//! Each [`DynamicViewCache`] keeps one staging cache per [`BindPoint`]. Parsing a
//! [`BindingLayout`] lays the table slots of this cache's kind out back to back in a flat
//! staging array and gives every slot an assigned mask with one bit per entry. Staging views
//! writes the array, sets their bits and marks the slot stale.
//!
//! A commit handles every stale slot of one bind point at once. Each slot takes
//! `highest assigned entry + 1` entries, and the slots are packed into a single contiguous
//! range reserved from the current table. Every assigned entry is copied, not only the ones
//! staged since the last commit, with one copy per run of set bits. Unassigned gaps are left
//! untouched.
//!
//! If the range does not fit, the current table is set aside and every slot with assigned
//! entries in either bind point is marked stale, because its bound range points into the
//! table that was set aside. The commit is then sized again and made into a fresh table.
//!
//! Tables set aside are retired to the [`DynamicTablePool`] under the context's fence when it
//! finishes, and the pool hands them out again once that fence is complete.

use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::{
    Device, HasDevice,
    command::RecordingBuffer,
    error::Result,
    fence::FenceValue,
    hal::{BindPoint, Command, CpuView, ViewTableKind},
    queue::QueueSet,
    retire::RetiredList,
    utils::BitMask,
};

use super::{BindingLayout, GpuViewRange, MAX_SLOTS, ViewTable};

/// Pool sizes of a [`DynamicTablePool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TablePoolStats {
    pub created: usize,
    pub available: usize,
    pub retired: usize,
}

#[derive(Default)]
struct PoolState {
    available: Vec<ViewTable>,
    retired: RetiredList<ViewTable>,
    created: usize,
}

/// Shader-visible tables of one kind, recycled once the GPU is done with them.
pub struct DynamicTablePool {
    device: Device,
    kind: ViewTableKind,
    capacity: u32,
    queues: Arc<QueueSet>,
    state: Mutex<PoolState>,
}

impl HasDevice for DynamicTablePool {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl DynamicTablePool {
    pub fn new(device: Device, kind: ViewTableKind, capacity: u32, queues: Arc<QueueSet>) -> Self {
        Self {
            device,
            kind,
            capacity,
            queues,
            state: Mutex::default(),
        }
    }

    pub fn kind(&self) -> ViewTableKind {
        self.kind
    }

    /// Number of views in every table of the pool.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn request_table(&self) -> Result<ViewTable> {
        let mut state = self.state.lock().unwrap();
        let PoolState {
            available, retired, ..
        } = &mut *state;
        available.extend(retired.drain_ready(|fence, _| self.queues.is_fence_complete(fence)));
        if let Some(table) = state.available.pop() {
            return Ok(table);
        }
        state.created += 1;
        tracing::info!(
            kind = self.kind.name(),
            capacity = self.capacity,
            total = state.created,
            "create dynamic view table"
        );
        ViewTable::new(self.device.clone(), self.kind, self.capacity, true)
    }

    /// Retires tables under `fence`. They become available once it is complete.
    pub fn discard_tables(&self, fence: FenceValue, tables: impl IntoIterator<Item = ViewTable>) {
        let mut state = self.state.lock().unwrap();
        for table in tables {
            debug_assert_eq!(table.kind(), self.kind);
            state.retired.retire(fence, table);
        }
    }

    pub fn stats(&self) -> TablePoolStats {
        let state = self.state.lock().unwrap();
        TablePoolStats {
            created: state.created,
            available: state.available.len(),
            retired: state.retired.len(),
        }
    }
}

#[derive(Clone, Default)]
struct SlotCache {
    /// Index of the slot's first entry in `StagingCache::staged`.
    start: usize,
    /// Entries staged since the layout was parsed.
    assigned: BitMask,
}

/// Staged views of one bind point.
#[derive(Default)]
struct StagingCache {
    slots: [SlotCache; MAX_SLOTS],
    table_slots: BitMask,
    stale_slots: BitMask,
    staged: Vec<Option<CpuView>>,
    bound: [Option<GpuViewRange>; MAX_SLOTS],
}

impl StagingCache {
    fn new() -> Self {
        Self {
            table_slots: BitMask::new(MAX_SLOTS),
            stale_slots: BitMask::new(MAX_SLOTS),
            ..Default::default()
        }
    }

    fn parse(&mut self, layout: &BindingLayout, kind: ViewTableKind) {
        self.clear();
        let mut start = 0;
        for slot in 0..layout.slots().len() {
            if let Some(size) = layout.table_size(slot, kind) {
                self.table_slots.set(slot);
                self.slots[slot] = SlotCache {
                    start,
                    assigned: BitMask::new(size as usize),
                };
                start += size as usize;
            }
        }
        self.staged.resize(start, None);
    }

    fn clear(&mut self) {
        self.slots = Default::default();
        self.table_slots.clear_all();
        self.stale_slots.clear_all();
        self.staged.clear();
        self.bound = [None; MAX_SLOTS];
    }

    /// Views needed to commit every stale slot.
    fn stale_size(&self) -> u32 {
        self.stale_slots
            .iter_set()
            .map(|slot| self.slots[slot].assigned.last_set().map_or(0, |last| last as u32 + 1))
            .sum()
    }

    /// Marks every slot with staged entries stale so it is committed again.
    fn mark_assigned_stale(&mut self) {
        for slot in self.table_slots.iter_set().collect::<SmallVec<[usize; MAX_SLOTS]>>() {
            if self.slots[slot].assigned.any() {
                self.stale_slots.set(slot);
            }
        }
    }
}

/// Per-context staging cache for views of one kind.
///
/// Views are staged per binding slot with [`set_views`](Self::set_views). Right before a draw
/// or dispatch, [`commit_stale_tables`](Self::commit_stale_tables) copies the staged views
/// of every slot written since the previous commit into one contiguous range of a pooled
/// shader-visible table and binds each slot to its part of the range.
///
/// A committed slot receives `highest staged offset + 1` table entries and every staged
/// entry is copied, so entries written before the previous commit remain bound. Copies are
/// issued per run of consecutive staged entries.
///
/// When the current table cannot fit a commit, it is retired and every slot with staged
/// entries is committed again into a fresh table, since its earlier range lives in the
/// retired table.
pub struct DynamicViewCache {
    kind: ViewTableKind,
    pool: Arc<DynamicTablePool>,
    current: Option<ViewTable>,
    next_free: u32,
    retired_tables: Vec<ViewTable>,
    graphics: StagingCache,
    compute: StagingCache,
}

impl DynamicViewCache {
    pub fn new(pool: Arc<DynamicTablePool>) -> Self {
        Self {
            kind: pool.kind,
            pool,
            current: None,
            next_free: 0,
            retired_tables: Vec::new(),
            graphics: StagingCache::new(),
            compute: StagingCache::new(),
        }
    }

    pub fn kind(&self) -> ViewTableKind {
        self.kind
    }

    fn staging(&mut self, bind_point: BindPoint) -> &mut StagingCache {
        match bind_point {
            BindPoint::Graphics => &mut self.graphics,
            BindPoint::Compute => &mut self.compute,
        }
    }

    /// Resets the staging cache of `bind_point` to the table slots of `layout`.
    pub fn parse_layout(&mut self, bind_point: BindPoint, layout: &BindingLayout) {
        let kind = self.kind;
        self.staging(bind_point).parse(layout, kind);
    }

    /// Stages `views` at `slot[offset..]`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not a table of this kind in the current layout or the views do
    /// not fit in it.
    pub fn set_views(
        &mut self,
        bind_point: BindPoint,
        slot: usize,
        offset: u32,
        views: &[CpuView],
    ) {
        let kind = self.kind;
        let cache = self.staging(bind_point);
        assert!(
            slot < MAX_SLOTS && cache.table_slots.get(slot),
            "slot {slot} is not a {} table in the current layout",
            kind.name()
        );
        if views.is_empty() {
            return;
        }
        let slot_cache = &mut cache.slots[slot];
        let offset = offset as usize;
        let end = offset + views.len();
        assert!(
            end <= slot_cache.assigned.len(),
            "views {offset}..{end} out of range of slot {slot} ({} entries)",
            slot_cache.assigned.len()
        );
        let start = slot_cache.start;
        slot_cache.assigned.set_range(offset..end);
        for (entry, view) in cache.staged[start + offset..start + end].iter_mut().zip(views) {
            *entry = Some(*view);
        }
        cache.stale_slots.set(slot);
    }

    fn has_space(&self, count: u32) -> bool {
        self.current.is_some() && self.next_free + count <= self.pool.capacity
    }

    /// Moves the current table to the retired list and restages every slot bound from it.
    fn retire_current_table(&mut self) {
        if let Some(table) = self.current.take() {
            self.retired_tables.push(table);
        }
        self.next_free = 0;
        self.graphics.mark_assigned_stale();
        self.compute.mark_assigned_stale();
    }

    fn reserve(&mut self, count: u32) -> Result<u32> {
        assert!(
            count <= self.pool.capacity,
            "{count} {} views do not fit in a dynamic table of {}",
            self.kind.name(),
            self.pool.capacity
        );
        if !self.has_space(count) {
            self.retire_current_table();
            self.current = Some(self.pool.request_table()?);
        }
        let offset = self.next_free;
        self.next_free += count;
        Ok(offset)
    }

    /// Copies the staged views of every stale slot into the current table and records the
    /// bindings into `buffer`. Does nothing if no slot is stale.
    pub fn commit_stale_tables(
        &mut self,
        bind_point: BindPoint,
        buffer: &mut RecordingBuffer,
    ) -> Result<()> {
        if !self.staging(bind_point).stale_slots.any() {
            return Ok(());
        }
        let needed = self.staging(bind_point).stale_size();
        if !self.has_space(needed) {
            // Retiring restages other slots as well, so size the commit afterwards.
            self.retire_current_table();
        }
        let needed = self.staging(bind_point).stale_size();
        let mut base = self.reserve(needed)?;
        let kind = self.kind;
        let Some(table) = self.current.as_ref().map(ViewTable::raw) else {
            return Ok(());
        };
        let device = self.pool.device.clone();
        let cache = self.staging(bind_point);
        let stale: SmallVec<[usize; MAX_SLOTS]> = cache.stale_slots.iter_set().collect();
        for slot in stale {
            let slot_cache = &cache.slots[slot];
            let Some(last) = slot_cache.assigned.last_set() else {
                continue;
            };
            for run in slot_cache.assigned.runs() {
                let views: SmallVec<[CpuView; 16]> = cache.staged
                    [slot_cache.start + run.start..slot_cache.start + run.end]
                    .iter()
                    .flatten()
                    .copied()
                    .collect();
                device
                    .driver()
                    .copy_views(table, base + run.start as u32, &views);
            }
            buffer.record(Command::BindViewTable {
                bind_point,
                slot: slot as u32,
                kind,
                table,
                offset: base,
            });
            let count = last as u32 + 1;
            cache.bound[slot] = Some(GpuViewRange {
                table,
                kind,
                offset: base,
                count,
            });
            base += count;
        }
        cache.stale_slots.clear_all();
        Ok(())
    }

    /// Copies a single view into the current table right away, bypassing the staging cache.
    pub fn upload_direct(&mut self, view: CpuView) -> Result<GpuViewRange> {
        let offset = self.reserve(1)?;
        let table = self.current.as_ref().map(ViewTable::raw).unwrap_or_default();
        self.pool.device.driver().copy_views(table, offset, &[view]);
        Ok(GpuViewRange {
            table,
            kind: self.kind,
            offset,
            count: 1,
        })
    }

    /// Marks every slot with staged entries stale, in both bind points. Used after the
    /// bindings of a recording buffer were lost.
    pub fn unbind_all_valid(&mut self) {
        self.graphics.mark_assigned_stale();
        self.compute.mark_assigned_stale();
    }

    /// The range last committed for `slot`.
    pub fn bound_views(&self, bind_point: BindPoint, slot: usize) -> Option<GpuViewRange> {
        let cache = match bind_point {
            BindPoint::Graphics => &self.graphics,
            BindPoint::Compute => &self.compute,
        };
        cache.bound.get(slot).copied().flatten()
    }

    /// Returns true if a commit for `bind_point` would copy anything.
    pub fn is_stale(&self, bind_point: BindPoint) -> bool {
        match bind_point {
            BindPoint::Graphics => self.graphics.stale_slots.any(),
            BindPoint::Compute => self.compute.stale_slots.any(),
        }
    }

    /// Entries of the current table used so far.
    pub fn used(&self) -> u32 {
        self.next_free
    }

    /// Retires every table used since the last cleanup under `fence` and forgets all staged
    /// views and layouts.
    pub fn cleanup_used_tables(&mut self, fence: FenceValue) {
        if let Some(table) = self.current.take() {
            self.retired_tables.push(table);
        }
        self.next_free = 0;
        self.pool.discard_tables(fence, self.retired_tables.drain(..));
        self.graphics.clear();
        self.compute.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::{PersistentViewAllocator, SlotDesc},
        hal::{QueueKind, RawResource, ViewDesc, soft::SoftDriver},
    };

    struct Fixture {
        driver: Arc<SoftDriver>,
        queues: Arc<QueueSet>,
        persistent: PersistentViewAllocator,
        pool: Arc<DynamicTablePool>,
    }

    fn fixture(capacity: u32) -> Fixture {
        let driver = Arc::new(SoftDriver::new());
        let device = Device::from_arc(driver.clone());
        let queues = Arc::new(QueueSet::new(&device, None).unwrap());
        Fixture {
            persistent: PersistentViewAllocator::new(device.clone(), ViewTableKind::Resource, 64),
            pool: Arc::new(DynamicTablePool::new(
                device,
                ViewTableKind::Resource,
                capacity,
                queues.clone(),
            )),
            driver,
            queues,
        }
    }

    impl Fixture {
        fn view(&self, id: u64) -> (CpuView, ViewDesc) {
            let cpu = self.persistent.allocate(1).unwrap();
            let desc = ViewDesc::SampledTexture {
                view: RawResource(id),
            };
            self.persistent.write(cpu, &desc);
            (cpu, desc)
        }
    }

    fn layout() -> BindingLayout {
        BindingLayout::new([
            SlotDesc::Table {
                kind: ViewTableKind::Resource,
                size: 8,
            },
            SlotDesc::Inline,
            SlotDesc::Table {
                kind: ViewTableKind::Resource,
                size: 4,
            },
            SlotDesc::Table {
                kind: ViewTableKind::Sampler,
                size: 2,
            },
        ])
    }

    #[test]
    fn commit_sizes_by_highest_offset() {
        let f = fixture(64);
        let mut cache = DynamicViewCache::new(f.pool.clone());
        let mut buffer = f.queues.get(QueueKind::Graphics).request_buffer().unwrap();
        cache.parse_layout(BindPoint::Graphics, &layout());

        let (a, _) = f.view(1);
        let (b, _) = f.view(2);
        let (c, _) = f.view(3);
        let (d, _) = f.view(4);
        cache.set_views(BindPoint::Graphics, 0, 2, &[a]);
        cache.set_views(BindPoint::Graphics, 2, 0, &[b, c]);
        cache.set_views(BindPoint::Graphics, 2, 3, &[d]);
        cache.commit_stale_tables(BindPoint::Graphics, &mut buffer).unwrap();

        assert_eq!(cache.used(), 3 + 4);
        let stats = f.driver.stats();
        assert_eq!(stats.view_copy_ops, 3);
        assert_eq!(stats.views_copied, 4);
        assert!(!cache.is_stale(BindPoint::Graphics));

        cache.commit_stale_tables(BindPoint::Graphics, &mut buffer).unwrap();
        assert_eq!(cache.used(), 7);
        assert_eq!(f.driver.stats().view_copy_ops, 3);
    }

    #[test]
    fn committed_views_read_back() {
        let f = fixture(64);
        let mut cache = DynamicViewCache::new(f.pool.clone());
        let mut buffer = f.queues.get(QueueKind::Compute).request_buffer().unwrap();
        cache.parse_layout(BindPoint::Compute, &layout());
        let (a, desc_a) = f.view(10);
        let (b, desc_b) = f.view(11);
        cache.set_views(BindPoint::Compute, 2, 1, &[a, b]);
        cache.commit_stale_tables(BindPoint::Compute, &mut buffer).unwrap();

        let range = cache.bound_views(BindPoint::Compute, 2).unwrap();
        assert_eq!(range.count, 3);
        assert_eq!(f.driver.read_view(range.table, range.index(1)), desc_a);
        assert_eq!(f.driver.read_view(range.table, range.index(2)), desc_b);
        assert_eq!(cache.bound_views(BindPoint::Graphics, 2), None);
    }

    #[test]
    fn full_table_restages_into_fresh_table() {
        let f = fixture(8);
        let mut cache = DynamicViewCache::new(f.pool.clone());
        let mut buffer = f.queues.get(QueueKind::Graphics).request_buffer().unwrap();
        cache.parse_layout(BindPoint::Graphics, &layout());
        let (a, _) = f.view(1);
        let (b, desc_b) = f.view(2);
        cache.set_views(BindPoint::Graphics, 0, 2, &[a]);
        cache.set_views(BindPoint::Graphics, 2, 3, &[b]);
        cache.commit_stale_tables(BindPoint::Graphics, &mut buffer).unwrap();
        let first = cache.bound_views(BindPoint::Graphics, 2).unwrap();
        assert_eq!(cache.used(), 7);

        cache.set_views(BindPoint::Graphics, 0, 0, &[a]);
        cache.commit_stale_tables(BindPoint::Graphics, &mut buffer).unwrap();
        let second = cache.bound_views(BindPoint::Graphics, 2).unwrap();
        assert_ne!(first.table, second.table);
        assert_eq!(cache.used(), 7);
        assert_eq!(f.driver.read_view(second.table, second.index(3)), desc_b);
        assert_eq!(f.pool.stats().created, 2);
    }

    #[test]
    fn tables_recycle_after_fence() {
        let f = fixture(16);
        let queue = f.queues.get(QueueKind::Graphics);
        let mut cache = DynamicViewCache::new(f.pool.clone());
        let (a, _) = f.view(1);
        let first = cache.upload_direct(a).unwrap().table;

        f.driver.pause(QueueKind::Graphics);
        let fence = queue.signal().unwrap();
        cache.cleanup_used_tables(fence);
        let second = cache.upload_direct(a).unwrap().table;
        assert_ne!(first, second);

        f.driver.resume(QueueKind::Graphics);
        queue.wait(fence).unwrap();
        cache.cleanup_used_tables(queue.signal().unwrap());
        let third = cache.upload_direct(a).unwrap();
        assert!(third.table == first || third.table == second);
        assert_eq!(third.offset, 0);
        assert_eq!(f.pool.stats().created, 2);
    }

    #[test]
    fn flush_restages_assigned_slots() {
        let f = fixture(64);
        let mut cache = DynamicViewCache::new(f.pool.clone());
        let mut buffer = f.queues.get(QueueKind::Graphics).request_buffer().unwrap();
        cache.parse_layout(BindPoint::Graphics, &layout());
        let (a, _) = f.view(1);
        cache.set_views(BindPoint::Graphics, 0, 0, &[a]);
        cache.commit_stale_tables(BindPoint::Graphics, &mut buffer).unwrap();
        assert!(!cache.is_stale(BindPoint::Graphics));
        cache.unbind_all_valid();
        assert!(cache.is_stale(BindPoint::Graphics));
        assert!(!cache.is_stale(BindPoint::Compute));
    }

    #[test]
    #[should_panic(expected = "is not a resource table")]
    fn staging_into_wrong_slot_panics() {
        let f = fixture(64);
        let mut cache = DynamicViewCache::new(f.pool.clone());
        cache.parse_layout(BindPoint::Graphics, &layout());
        let (a, _) = f.view(1);
        cache.set_views(BindPoint::Graphics, 3, 0, &[a]);
    }
}
