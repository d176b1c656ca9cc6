//! A shader-visible view table sized once and filled by bump allocation.

use crate::{
    Device, HasDevice,
    error::Result,
    hal::{CpuView, RawViewTable, ViewDesc, ViewTableKind},
};

use super::{GpuViewRange, ViewTable};

/// A shader-visible table of fixed capacity, for bindings that stay put.
///
/// Ranges are bump-allocated and never freed. Running out of space is a sizing mistake of
/// the caller, so [`alloc`](Self::alloc) panics; use [`try_alloc`](Self::try_alloc) to probe.
#[derive(Debug)]
pub struct FixedViewTable {
    table: ViewTable,
    next: u32,
}

impl HasDevice for FixedViewTable {
    fn device(&self) -> &Device {
        self.table.device()
    }
}

impl FixedViewTable {
    pub fn new(device: Device, kind: ViewTableKind, capacity: u32) -> Result<Self> {
        Ok(Self {
            table: ViewTable::new(device, kind, capacity, true)?,
            next: 0,
        })
    }

    pub fn raw(&self) -> RawViewTable {
        self.table.raw()
    }
    pub fn capacity(&self) -> u32 {
        self.table.capacity()
    }
    /// Number of slots handed out so far.
    pub fn allocated(&self) -> u32 {
        self.next
    }

    pub fn has_space(&self, count: u32) -> bool {
        self.next
            .checked_add(count)
            .is_some_and(|end| end <= self.table.capacity())
    }

    pub fn try_alloc(&mut self, count: u32) -> Option<GpuViewRange> {
        if !self.has_space(count) {
            return None;
        }
        let offset = self.next;
        self.next += count;
        Some(GpuViewRange {
            table: self.table.raw(),
            kind: self.table.kind(),
            offset,
            count,
        })
    }

    /// # Panics
    ///
    /// Panics if the table does not have `count` free slots left.
    pub fn alloc(&mut self, count: u32) -> GpuViewRange {
        let remaining = self.table.capacity() - self.next;
        self.try_alloc(count).unwrap_or_else(|| {
            panic!(
                "fixed {} view table exhausted: {count} requested, {remaining} left",
                self.table.kind().name()
            )
        })
    }

    /// Writes a view directly into the table.
    pub fn write(&self, index: u32, desc: &ViewDesc) {
        self.device().driver().write_view(self.table.raw(), index, desc);
    }

    /// Copies persistent views into the table starting at `index`.
    pub fn copy(&self, index: u32, views: &[CpuView]) {
        self.device()
            .driver()
            .copy_views(self.table.raw(), index, views);
    }
}
