//! # Memory Layout

use kernel_memory_addresses::{FrameNumber, PAGE_SIZE};

const MIB: u32 = 1024 * 1024;

/// Size of one physical frame in bytes.
pub const FRAME_SIZE: u32 = PAGE_SIZE;

/// First frame of the kernel frame pool (2 MiB).
pub const KERNEL_POOL_START_FRAME: FrameNumber = FrameNumber::new(2 * MIB / FRAME_SIZE);

/// Number of frames in the kernel frame pool (2 MiB worth).
pub const KERNEL_POOL_FRAMES: u32 = 2 * MIB / FRAME_SIZE;

/// First frame of the process frame pool (4 MiB).
pub const PROCESS_POOL_START_FRAME: FrameNumber = FrameNumber::new(4 * MIB / FRAME_SIZE);

/// Number of frames in the process frame pool (28 MiB worth).
pub const PROCESS_POOL_FRAMES: u32 = 28 * MIB / FRAME_SIZE;

/// First frame of the inaccessible physical hole at 15 MiB.
pub const MEMORY_HOLE_START_FRAME: FrameNumber = FrameNumber::new(15 * MIB / FRAME_SIZE);

/// Number of frames in the memory hole (1 MiB worth).
pub const MEMORY_HOLE_FRAMES: u32 = MIB / FRAME_SIZE;

/// Bytes at the bottom of the address space that every page directory
/// identity maps (one second-level table's reach).
pub const SHARED_SIZE: u32 = 4 * MIB;

const _: () = {
    let kernel_end = KERNEL_POOL_START_FRAME.as_u32() + KERNEL_POOL_FRAMES;
    let process_end = PROCESS_POOL_START_FRAME.as_u32() + PROCESS_POOL_FRAMES;
    let hole_end = MEMORY_HOLE_START_FRAME.as_u32() + MEMORY_HOLE_FRAMES;

    assert!(kernel_end <= PROCESS_POOL_START_FRAME.as_u32());
    assert!(kernel_end * FRAME_SIZE <= SHARED_SIZE);
    assert!(MEMORY_HOLE_START_FRAME.as_u32() >= PROCESS_POOL_START_FRAME.as_u32());
    assert!(hole_end <= process_end);
    assert!(SHARED_SIZE == 1024 * PAGE_SIZE);
};
