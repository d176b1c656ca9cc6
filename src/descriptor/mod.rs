//! View tables.
//!
//! Shaders reach resources through tables of views. Three allocators hand out table space,
//! one per lifetime:
//!
//! - [`PersistentViewAllocator`]: CPU-visible views that live as long as the runtime. Views
//!   are written here once, when the resource is created, and copied into shader-visible
//!   tables whenever they are bound.
//! - [`FixedViewTable`]: a single shader-visible table sized up front, for bindings that
//!   never change.
//! - [`DynamicViewCache`]: the per-context staging cache. Views are staged per binding slot
//!   and committed right before a draw or dispatch into a range of a pooled shader-visible
//!   table taken from a [`DynamicTablePool`].
//!
//! Views of the two [`ViewTableKind`]s never share a table.

mod dynamic;
mod fixed;
mod layout;
mod persistent;

use std::fmt::Debug;

pub use dynamic::{DynamicTablePool, DynamicViewCache, TablePoolStats};
pub use fixed::FixedViewTable;
pub use layout::{BindingLayout, MAX_SLOTS, MAX_STAGED_VIEWS, SlotDesc};
pub use persistent::PersistentViewAllocator;

use crate::{
    Device, HasDevice,
    error::Result,
    hal::{RawViewTable, ViewTableKind},
};

/// A contiguous range of a shader-visible table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GpuViewRange {
    pub table: RawViewTable,
    pub kind: ViewTableKind,
    pub offset: u32,
    pub count: u32,
}

impl GpuViewRange {
    /// Absolute table index of the `i`th view of the range.
    pub fn index(&self, i: u32) -> u32 {
        assert!(i < self.count, "view {i} out of range of {self:?}");
        self.offset + i
    }
}

/// An owned native view table.
pub struct ViewTable {
    device: Device,
    raw: RawViewTable,
    kind: ViewTableKind,
    capacity: u32,
    shader_visible: bool,
}

impl HasDevice for ViewTable {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Debug for ViewTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewTable")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("shader_visible", &self.shader_visible)
            .finish()
    }
}

impl ViewTable {
    pub fn new(
        device: Device,
        kind: ViewTableKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<Self> {
        let raw = device
            .driver()
            .create_view_table(kind, capacity, shader_visible)?;
        Ok(Self {
            device,
            raw,
            kind,
            capacity,
            shader_visible,
        })
    }

    pub fn raw(&self) -> RawViewTable {
        self.raw
    }
    pub fn kind(&self) -> ViewTableKind {
        self.kind
    }
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
    pub fn is_shader_visible(&self) -> bool {
        self.shader_visible
    }
}

impl Drop for ViewTable {
    fn drop(&mut self) {
        self.device.driver().destroy_view_table(self.raw);
    }
}
