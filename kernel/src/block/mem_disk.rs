use super::{BlockError, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::{vec, vec::Vec};

/// A RAM-backed block device driver. Contents are lost on reboot, which is all
/// swap needs.
pub struct MemDisk {
    sectors: Vec<[u8; BLOCK_SECTOR_SIZE]>,
}

impl MemDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            sectors: vec![[0; BLOCK_SECTOR_SIZE]; sectors as usize],
        }
    }

    fn sector(&self, sector: BlockSector) -> Option<&[u8; BLOCK_SECTOR_SIZE]> {
        self.sectors.get(sector as usize)
    }
}

impl BlockOp for MemDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let data = self.sector(sector).ok_or(BlockError::ReadError(sector))?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let data = self
            .sectors
            .get_mut(sector as usize)
            .ok_or(BlockError::WriteError(sector))?;
        data.copy_from_slice(buf);
        Ok(())
    }
}
