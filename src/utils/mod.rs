mod bitmask;

pub use bitmask::BitMask;
