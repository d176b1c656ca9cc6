//! CPU-visible view slots that live as long as the runtime.

use std::sync::Mutex;

use crate::{
    Device, HasDevice,
    error::Result,
    hal::{CpuView, ViewDesc, ViewTableKind},
};

use super::ViewTable;

struct State {
    tables: Vec<ViewTable>,
    next: u32,
}

/// Hands out CPU-visible view slots for the lifetime of the runtime.
///
/// Slots are bump-allocated from fixed-size backing tables and never recycled. A new backing
/// table is created whenever the current one cannot fit a request. All backing tables are
/// destroyed together with the allocator.
///
/// Views may be allocated from any thread.
pub struct PersistentViewAllocator {
    device: Device,
    kind: ViewTableKind,
    views_per_table: u32,
    state: Mutex<State>,
}

impl HasDevice for PersistentViewAllocator {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl PersistentViewAllocator {
    pub fn new(device: Device, kind: ViewTableKind, views_per_table: u32) -> Self {
        Self {
            device,
            kind,
            views_per_table,
            state: Mutex::new(State {
                tables: Vec::new(),
                next: 0,
            }),
        }
    }

    pub fn kind(&self) -> ViewTableKind {
        self.kind
    }

    /// Allocates `count` contiguous slots and returns the first one.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero or larger than a backing table.
    pub fn allocate(&self, count: u32) -> Result<CpuView> {
        assert!(
            count > 0 && count <= self.views_per_table,
            "cannot allocate {count} views from tables of {}",
            self.views_per_table
        );
        let mut state = self.state.lock().unwrap();
        if state.tables.is_empty() || state.next + count > self.views_per_table {
            let table =
                ViewTable::new(self.device.clone(), self.kind, self.views_per_table, false)?;
            tracing::info!(
                kind = self.kind.name(),
                tables = state.tables.len() + 1,
                "create persistent view table"
            );
            state.tables.push(table);
            state.next = 0;
        }
        let index = state.next;
        state.next += count;
        let table = state.tables.last().map(ViewTable::raw).unwrap_or_default();
        Ok(CpuView { table, index })
    }

    /// Writes a view into a slot returned by [`allocate`](Self::allocate).
    pub fn write(&self, view: CpuView, desc: &ViewDesc) {
        self.device.driver().write_view(view.table, view.index, desc);
    }

    /// Number of backing tables created so far.
    pub fn table_count(&self) -> usize {
        self.state.lock().unwrap().tables.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hal::{RawResource, soft::SoftDriver};

    #[test]
    fn bump_allocates_and_spills() {
        let driver = Arc::new(SoftDriver::new());
        let device = Device::from_arc(driver.clone());
        let allocator = PersistentViewAllocator::new(device, ViewTableKind::Resource, 4);
        let a = allocator.allocate(3).unwrap();
        let b = allocator.allocate(1).unwrap();
        let c = allocator.allocate(2).unwrap();
        assert_eq!((a.index, b.index, c.index), (0, 3, 0));
        assert_eq!(a.table, b.table);
        assert_ne!(b.table, c.table);
        assert_eq!(allocator.table_count(), 2);

        let desc = ViewDesc::StorageTexture {
            view: RawResource(5),
        };
        allocator.write(a.offset(2), &desc);
        assert_eq!(driver.read_view(a.table, 2), desc);
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let allocator = PersistentViewAllocator::new(
            Device::new(SoftDriver::new()),
            ViewTableKind::Sampler,
            16,
        );
        let views: Vec<CpuView> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..10)
                            .map(|_| allocator.allocate(1).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        let unique: std::collections::HashSet<_> = views.iter().collect();
        assert_eq!(unique.len(), 40);
    }

    #[test]
    #[should_panic(expected = "cannot allocate")]
    fn oversized_request_panics() {
        let device = Device::new(SoftDriver::new());
        let allocator = PersistentViewAllocator::new(device, ViewTableKind::Resource, 4);
        allocator.allocate(5).ok();
    }
}
