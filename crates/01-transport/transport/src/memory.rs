//! Flat, `u32`-addressed memory shared by compute threads and the host.
//!
//! This is the in-process analogue of a shared wasm linear memory: every
//! buffer, wire message and result word handed across the boundary is a plain
//! address into one [`LinearMemory`]. Address 0 is reserved as "null".
//!
//! Byte access is `unsafe` because the memory itself enforces nothing; the
//! ownership protocol layered on top (exclusive vs shared handles, blocked
//! requesters) is what rules out concurrent mutable aliasing.

use crate::region::SharedRegion;
use crate::{TransportError, TransportResult};
use std::mem::{align_of, size_of};
use std::sync::atomic::AtomicU32;

/// Alignment of the whole memory and the minimum alignment of allocations.
pub const MEMORY_ALIGNMENT: usize = 8;

/// Shared linear memory backing every cross-boundary address.
#[derive(Debug)]
pub struct LinearMemory {
    region: SharedRegion,
}

impl LinearMemory {
    /// Smallest memory we are willing to create.
    pub const MIN_SIZE: usize = 64;

    /// Creates a zeroed memory of `size` bytes (rounded up to 8).
    pub fn new(size: usize) -> TransportResult<Self> {
        let size = size.max(Self::MIN_SIZE).next_multiple_of(MEMORY_ALIGNMENT);
        if size > u32::MAX as usize {
            return Err(TransportError::InvalidCapacity {
                requested: size,
                minimum: Self::MIN_SIZE,
            });
        }
        let region = SharedRegion::new_zeroed(size, 64)?;
        Ok(Self { region })
    }

    /// Size of the memory in bytes.
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Validates that `[addr, addr + len)` lies inside the memory.
    pub fn check_range(&self, addr: u32, len: usize) -> TransportResult<()> {
        let end = (addr as usize).checked_add(len);
        match end {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(TransportError::OutOfRange {
                addr,
                len,
                size: self.size(),
            }),
        }
    }

    fn check_aligned(addr: u32, alignment: usize) -> TransportResult<()> {
        if addr as usize % alignment != 0 {
            return Err(TransportError::Misaligned { addr, alignment });
        }
        Ok(())
    }

    /// Returns the 32-bit word at `addr` as an atomic.
    pub fn atomic_u32(&self, addr: u32) -> TransportResult<&AtomicU32> {
        self.check_range(addr, size_of::<u32>())?;
        Self::check_aligned(addr, align_of::<AtomicU32>())?;
        // SAFETY: in range, aligned, and the region outlives `&self`. Atomic access
        // to shared memory is always allowed.
        Ok(unsafe { &*(self.region.base_ptr().add(addr as usize) as *const AtomicU32) })
    }

    /// Reads a little-endian `u64` at `addr`.
    ///
    /// # Safety
    /// No other context may be writing these bytes concurrently.
    pub unsafe fn read_u64_le(&self, addr: u32) -> TransportResult<u64> {
        let mut bytes = [0u8; 8];
        self.copy_out(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Copies `src` into memory at `addr`.
    ///
    /// # Safety
    /// The caller must own `[addr, addr + src.len())` exclusively for the call.
    pub unsafe fn copy_in(&self, addr: u32, src: &[u8]) -> TransportResult<()> {
        self.check_range(addr, src.len())?;
        std::ptr::copy_nonoverlapping(
            src.as_ptr(),
            self.region.base_ptr().add(addr as usize),
            src.len(),
        );
        Ok(())
    }

    /// Copies memory at `addr` into `dst`.
    ///
    /// # Safety
    /// No other context may be writing `[addr, addr + dst.len())` concurrently.
    pub unsafe fn copy_out(&self, addr: u32, dst: &mut [u8]) -> TransportResult<()> {
        self.check_range(addr, dst.len())?;
        std::ptr::copy_nonoverlapping(
            self.region.base_ptr().add(addr as usize),
            dst.as_mut_ptr(),
            dst.len(),
        );
        Ok(())
    }

    /// Moves `len` bytes from `src` to `dst`; the ranges may overlap.
    ///
    /// # Safety
    /// The caller must own both ranges exclusively for the call.
    pub unsafe fn copy_within(&self, src: u32, dst: u32, len: usize) -> TransportResult<()> {
        self.check_range(src, len)?;
        self.check_range(dst, len)?;
        let base = self.region.base_ptr();
        std::ptr::copy(base.add(src as usize), base.add(dst as usize), len);
        Ok(())
    }

    /// Borrows `count` elements of `T` at `addr`.
    ///
    /// # Safety
    /// Nobody may mutate the range while the slice is alive, and any bit
    /// pattern must be a valid `T`.
    pub unsafe fn slice<T: Copy>(&self, addr: u32, count: usize) -> TransportResult<&[T]> {
        let bytes = count.saturating_mul(size_of::<T>());
        self.check_range(addr, bytes)?;
        Self::check_aligned(addr, align_of::<T>())?;
        Ok(std::slice::from_raw_parts(
            self.region.base_ptr().add(addr as usize) as *const T,
            count,
        ))
    }

    /// Mutably borrows `count` elements of `T` at `addr`.
    ///
    /// # Safety
    /// The caller must hold exclusive ownership of the range for the lifetime
    /// of the slice, and any bit pattern must be a valid `T`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut<T: Copy>(&self, addr: u32, count: usize) -> TransportResult<&mut [T]> {
        let bytes = count.saturating_mul(size_of::<T>());
        self.check_range(addr, bytes)?;
        Self::check_aligned(addr, align_of::<T>())?;
        Ok(std::slice::from_raw_parts_mut(
            self.region.base_ptr().add(addr as usize) as *mut T,
            count,
        ))
    }
}
