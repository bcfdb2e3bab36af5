pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const SECTOR_SIZE: u32 = 512;
pub const SECTORS_PER_PAGE: u32 = (crate::mem::PAGE_FRAME_SIZE / SECTOR_SIZE as usize) as u32;
