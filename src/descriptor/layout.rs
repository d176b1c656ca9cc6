//! Binding layouts: the parameter slots a pipeline expects, and how many views of each kind
//! they stage.

use smallvec::SmallVec;

use crate::hal::ViewTableKind;

/// Maximum number of slots in a [`BindingLayout`].
pub const MAX_SLOTS: usize = 16;

/// Maximum number of views a [`BindingLayout`] may stage per [`ViewTableKind`].
pub const MAX_STAGED_VIEWS: u32 = 256;

/// One parameter slot of a pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SlotDesc {
    /// A range of `size` views of one kind, bound as a table.
    Table { kind: ViewTableKind, size: u32 },
    /// A value bound directly instead of through a table, such as push constants.
    Inline,
}

/// The slots a pipeline expects to be bound.
///
/// ```
/// # use scoria::{descriptor::{BindingLayout, SlotDesc}, hal::ViewTableKind};
/// let layout = BindingLayout::new([
///     SlotDesc::Inline,
///     SlotDesc::Table { kind: ViewTableKind::Resource, size: 8 },
///     SlotDesc::Table { kind: ViewTableKind::Sampler, size: 2 },
/// ]);
/// assert_eq!(layout.staged_views(ViewTableKind::Resource), 8);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct BindingLayout {
    slots: SmallVec<[SlotDesc; MAX_SLOTS]>,
}

impl BindingLayout {
    /// # Panics
    ///
    /// Panics if there are more than [`MAX_SLOTS`] slots, a table slot is empty, or the
    /// tables of one kind add up to more than [`MAX_STAGED_VIEWS`] views.
    pub fn new(slots: impl IntoIterator<Item = SlotDesc>) -> Self {
        let slots: SmallVec<[SlotDesc; MAX_SLOTS]> = slots.into_iter().collect();
        assert!(
            slots.len() <= MAX_SLOTS,
            "binding layout has {} slots; the limit is {MAX_SLOTS}",
            slots.len()
        );
        let layout = Self { slots };
        for (index, slot) in layout.slots.iter().enumerate() {
            if let SlotDesc::Table { size, .. } = slot {
                assert!(*size > 0, "table slot {index} is empty");
            }
        }
        for kind in ViewTableKind::ALL {
            let staged = layout.staged_views(kind);
            assert!(
                staged <= MAX_STAGED_VIEWS,
                "binding layout stages {staged} {} views; the limit is {MAX_STAGED_VIEWS}",
                kind.name()
            );
        }
        layout
    }

    pub fn slots(&self) -> &[SlotDesc] {
        &self.slots
    }

    /// Size of the table bound at `slot`, if it is a table of `kind`.
    pub fn table_size(&self, slot: usize, kind: ViewTableKind) -> Option<u32> {
        match self.slots.get(slot) {
            Some(SlotDesc::Table { kind: k, size }) if *k == kind => Some(*size),
            _ => None,
        }
    }

    /// Total number of views of `kind` across all table slots.
    pub fn staged_views(&self, kind: ViewTableKind) -> u32 {
        (0..self.slots.len())
            .filter_map(|slot| self.table_size(slot, kind))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_sizes_by_kind() {
        let layout = BindingLayout::new([
            SlotDesc::Table {
                kind: ViewTableKind::Sampler,
                size: 4,
            },
            SlotDesc::Inline,
            SlotDesc::Table {
                kind: ViewTableKind::Resource,
                size: 16,
            },
        ]);
        assert_eq!(layout.table_size(0, ViewTableKind::Sampler), Some(4));
        assert_eq!(layout.table_size(0, ViewTableKind::Resource), None);
        assert_eq!(layout.table_size(1, ViewTableKind::Resource), None);
        assert_eq!(layout.table_size(7, ViewTableKind::Resource), None);
        assert_eq!(layout.staged_views(ViewTableKind::Resource), 16);
    }

    #[test]
    #[should_panic(expected = "the limit is 256")]
    fn too_many_staged_views() {
        BindingLayout::new([
            SlotDesc::Table {
                kind: ViewTableKind::Resource,
                size: 200,
            },
            SlotDesc::Table {
                kind: ViewTableKind::Resource,
                size: 57,
            },
        ]);
    }

    #[test]
    #[should_panic(expected = "the limit is 16")]
    fn too_many_slots() {
        BindingLayout::new([SlotDesc::Inline; 17]);
    }
}
