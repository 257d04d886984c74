//! # Bitmap Frame Allocator
//!
//! One [`BitmapFrameAlloc`] manages a contiguous range of physical frames
//! with one bit per frame (`0` = free, `1` = used). The bitmap occupies a
//! single frame, which caps a pool at [`MAX_POOL_FRAMES`] frames.
//!
//! ```text
//!  base_frame                                   base_frame + frame_count
//!      │                                                   │
//!      ▼                                                   ▼
//!      ┌───┬───┬───┬───┬───────────────┬───┬───┬───────────┐
//!      │ B │ 1 │ 0 │ 1 │   reserved    │ 0 │ 0 │    ...    │
//!      └───┴───┴───┴───┴───────────────┴───┴───┴───────────┘
//!        │             └─ never handed out, never released
//!        └─ bitmap frame (when it lives inside the pool)
//! ```
//!
//! Allocation always returns the lowest free frame, which keeps tests
//! reproducible.

use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::FrameNumber;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{error, info};

/// Frames one bitmap frame can track.
pub const MAX_POOL_FRAMES: u32 = FRAME_SIZE * 8;

/// How many permanently reserved ranges a pool can hold.
pub const MAX_RESERVED_RANGES: usize = 4;

const BITMAP_BYTES: usize = FRAME_SIZE as usize;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("frame {frame} lies outside the pool")]
    OutsidePool { frame: FrameNumber },
    #[error("frame {frame} is reserved")]
    Reserved { frame: FrameNumber },
    #[error("frame {frame} holds the allocation bitmap")]
    BitmapFrame { frame: FrameNumber },
    #[error("frame {frame} is already free")]
    AlreadyFree { frame: FrameNumber },
    #[error("{count} frames from {start} exceed the pool")]
    RangeOutOfBounds { start: FrameNumber, count: u32 },
    #[error("no room for another reserved range")]
    TooManyReservations,
    #[error("a pool of {frames} frames does not fit one bitmap frame")]
    PoolTooLarge { frames: u32 },
    #[error("a pool without frames needs an external bitmap frame")]
    EmptyPool,
    #[error("no frame left for a bitmap")]
    Exhausted,
}

/// A permanently used range of frames.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReservedRange {
    pub start: FrameNumber,
    pub count: u32,
}

impl ReservedRange {
    #[inline]
    #[must_use]
    pub fn contains(&self, frame: FrameNumber) -> bool {
        frame
            .distance_from(self.start)
            .is_some_and(|offset| offset < self.count)
    }
}

/// Bitmap-backed allocator over `[base_frame, base_frame + frame_count)`.
pub struct BitmapFrameAlloc<'m> {
    bitmap: &'m mut [u8; BITMAP_BYTES],
    base: FrameNumber,
    count: u32,
    bitmap_frame: FrameNumber,
    reserved: [Option<ReservedRange>; MAX_RESERVED_RANGES],
    free: u32,
}

impl<'m> BitmapFrameAlloc<'m> {
    /// Set up a pool of `frame_count` frames starting at `base_frame`.
    ///
    /// With `bitmap_frame == None` the bitmap is kept in the pool's first
    /// frame. Otherwise it is kept in the given frame, typically one taken
    /// from an earlier pool. A bitmap frame inside the pool is marked used;
    /// every other frame starts free.
    ///
    /// # Safety
    /// The bitmap frame must be reachable through `mapper`, must not be in
    /// use for anything else and must stay valid for `'m`.
    ///
    /// # Errors
    /// [`FrameError::PoolTooLarge`] or [`FrameError::EmptyPool`].
    pub unsafe fn new<M: PhysMapper>(
        mapper: &M,
        base_frame: FrameNumber,
        frame_count: u32,
        bitmap_frame: Option<FrameNumber>,
    ) -> Result<Self, FrameError> {
        if frame_count > MAX_POOL_FRAMES {
            return Err(FrameError::PoolTooLarge {
                frames: frame_count,
            });
        }
        if frame_count == 0 && bitmap_frame.is_none() {
            return Err(FrameError::EmptyPool);
        }

        let bitmap_frame = bitmap_frame.unwrap_or(base_frame);
        // SAFETY: forwarded to the caller.
        let bitmap = unsafe { mapper.phys_to_mut::<[u8; BITMAP_BYTES]>(bitmap_frame.address()) };
        bitmap.fill(0);

        let mut pool = Self {
            bitmap,
            base: base_frame,
            count: frame_count,
            bitmap_frame,
            reserved: [None; MAX_RESERVED_RANGES],
            free: frame_count,
        };
        if let Some(index) = pool.index_of(bitmap_frame) {
            pool.mark_used(index);
        }

        info!(
            "frame pool {base_frame}+{frame_count}, bitmap in {bitmap_frame}, {} free",
            pool.free
        );
        Ok(pool)
    }

    #[inline]
    #[must_use]
    pub const fn base_frame(&self) -> FrameNumber {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> u32 {
        self.count
    }

    #[inline]
    #[must_use]
    pub const fn bitmap_frame(&self) -> FrameNumber {
        self.bitmap_frame
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.free
    }

    #[must_use]
    pub fn contains(&self, frame: FrameNumber) -> bool {
        self.index_of(frame).is_some()
    }

    /// Whether `frame` belongs to this pool and is currently free.
    #[must_use]
    pub fn is_free(&self, frame: FrameNumber) -> bool {
        self.index_of(frame).is_some_and(|index| !self.is_used(index))
    }

    pub fn reserved_ranges(&self) -> impl Iterator<Item = ReservedRange> + '_ {
        self.reserved.iter().flatten().copied()
    }

    /// Take the lowest free frame, or `None` if the pool is exhausted.
    pub fn acquire(&mut self) -> Option<FrameNumber> {
        let (byte_index, byte) = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != u8::MAX)?;
        let index = byte_index * 8 + byte.trailing_ones() as usize;
        if index >= self.count as usize {
            return None;
        }

        self.mark_used(index);
        #[allow(clippy::cast_possible_truncation)]
        Some(self.base + index as u32)
    }

    /// Permanently mark `count` frames starting at `start` as used.
    ///
    /// # Errors
    /// - [`FrameError::RangeOutOfBounds`] if the range leaves the pool.
    /// - [`FrameError::TooManyReservations`] once [`MAX_RESERVED_RANGES`]
    ///   ranges are registered.
    pub fn reserve_range(&mut self, start: FrameNumber, count: u32) -> Result<(), FrameError> {
        let first = start
            .distance_from(self.base)
            .filter(|first| first.checked_add(count).is_some_and(|end| end <= self.count));
        let Some(first) = first else {
            error!("reserved range {start}+{count} exceeds pool {}+{}", self.base, self.count);
            return Err(FrameError::RangeOutOfBounds { start, count });
        };
        let Some(slot) = self.reserved.iter_mut().find(|slot| slot.is_none()) else {
            error!("no room to reserve {start}+{count}");
            return Err(FrameError::TooManyReservations);
        };

        *slot = Some(ReservedRange { start, count });
        for index in first as usize..(first + count) as usize {
            if !self.is_used(index) {
                self.mark_used(index);
            }
        }
        info!("reserved {start}+{count}, {} free", self.free);
        Ok(())
    }

    /// Give `frame` back.
    ///
    /// Nothing changes when the release is refused.
    ///
    /// # Errors
    /// The frame is outside the pool, reserved, the bitmap frame or free.
    pub fn release(&mut self, frame: FrameNumber) -> Result<(), FrameError> {
        let index = self.releasable(frame)?;
        self.bitmap[index / 8] &= !(1 << (index % 8));
        self.free += 1;
        Ok(())
    }

    /// Whether [`release`](Self::release) would accept `frame`; changes nothing.
    ///
    /// # Errors
    /// The refusal `release` would report.
    pub fn check_release(&self, frame: FrameNumber) -> Result<(), FrameError> {
        self.releasable(frame).map(|_| ())
    }

    fn releasable(&self, frame: FrameNumber) -> Result<usize, FrameError> {
        let Some(index) = self.index_of(frame) else {
            error!("release of {frame} outside pool {}+{}", self.base, self.count);
            return Err(FrameError::OutsidePool { frame });
        };
        if self.reserved_ranges().any(|range| range.contains(frame)) {
            error!("release of reserved {frame}");
            return Err(FrameError::Reserved { frame });
        }
        if frame == self.bitmap_frame {
            error!("release of bitmap {frame}");
            return Err(FrameError::BitmapFrame { frame });
        }
        if !self.is_used(index) {
            error!("double release of {frame}");
            return Err(FrameError::AlreadyFree { frame });
        }
        Ok(index)
    }

    fn index_of(&self, frame: FrameNumber) -> Option<usize> {
        frame
            .distance_from(self.base)
            .filter(|offset| *offset < self.count)
            .map(|offset| offset as usize)
    }

    fn is_used(&self, index: usize) -> bool {
        self.bitmap[index / 8] & (1 << (index % 8)) != 0
    }

    fn mark_used(&mut self, index: usize) {
        debug_assert!(!self.is_used(index));
        self.bitmap[index / 8] |= 1 << (index % 8);
        self.free -= 1;
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    type Error = FrameError;

    fn acquire(&mut self) -> Option<FrameNumber> {
        Self::acquire(self)
    }

    fn release(&mut self, frame: FrameNumber) -> Result<(), Self::Error> {
        Self::release(self, frame)
    }

    fn check_release(&self, frame: FrameNumber) -> Result<(), Self::Error> {
        Self::check_release(self, frame)
    }
}
