pub mod models;
pub mod util;

/// Offsets and sizes in most container headers are expressed in media units.
pub const MEDIA_UNIT_SIZE: u32 = 0x200;
