//! Victim selection for frame eviction.

/// What a replacement policy needs to know about a frame.
pub trait ReplacementCandidate {
    /// Whether the frame must not be evicted right now.
    fn pinned(&self) -> bool;

    /// Returns whether the frame was referenced since the last call, and
    /// clears the reference bit.
    fn test_and_clear_accessed(&self) -> bool;
}

pub trait PageReplacementPolicy {
    /// Picks a frame to evict from `frames`, where `None` marks a vacant
    /// slot. Returns the victim's index, or `None` if no frame could be
    /// chosen.
    fn select_victim<C: ReplacementCandidate>(&mut self, frames: &[Option<C>]) -> Option<usize>;
}

/// The clock algorithm.
///
/// A single hand sweeps the frames in order, giving each referenced frame a
/// second chance by clearing its reference bit. Pinned frames are passed
/// over. The sweep gives up after `max_passes` full revolutions so a pool of
/// pinned frames cannot keep the caller spinning.
#[derive(Debug)]
pub struct SecondChance {
    hand: usize,
    max_passes: usize,
}

impl SecondChance {
    pub const fn new(max_passes: usize) -> Self {
        Self {
            hand: 0,
            max_passes,
        }
    }

    pub fn hand(&self) -> usize {
        self.hand
    }

    #[cfg(test)]
    fn starting_at(hand: usize, max_passes: usize) -> Self {
        Self { hand, max_passes }
    }
}

impl PageReplacementPolicy for SecondChance {
    fn select_victim<C: ReplacementCandidate>(&mut self, frames: &[Option<C>]) -> Option<usize> {
        let len = frames.len();
        if len == 0 {
            return None;
        }

        for _ in 0..len.saturating_mul(self.max_passes) {
            let index = self.hand % len;
            self.hand = (index + 1) % len;

            let Some(frame) = &frames[index] else {
                continue;
            };
            if frame.test_and_clear_accessed() || frame.pinned() {
                continue;
            }
            return Some(index);
        }

        None
    }
}
