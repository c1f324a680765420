//! Raw backing memory for the bridge.
//!
//! Both the linear memory shared by compute and host contexts and the task
//! broker's control region sit on a [`SharedRegion`]: a fixed-size, zeroed,
//! aligned allocation. Native targets prefer anonymous `mmap` regions; when the
//! mapping is not suitably aligned (or on WebAssembly) we fall back to the heap.
//!
//! The region never moves and never grows, so raw pointers into it stay valid
//! for its whole lifetime. Synchronisation of the bytes is the caller's job.

use crate::{TransportError, TransportResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

#[cfg(not(target_arch = "wasm32"))]
type NativeMap = memmap2::MmapMut;

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Native(NativeMap),
    Owned {
        ptr: NonNull<u8>,
        layout: Layout,
    },
}

impl Backing {
    fn base(&self) -> *mut u8 {
        match self {
            #[cfg(not(target_arch = "wasm32"))]
            Backing::Native(map) => map.as_ptr() as *mut u8,
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// Fixed, zero-initialised memory shared between execution contexts.
#[derive(Debug)]
pub struct SharedRegion {
    len: usize,
    alignment: usize,
    backing: Backing,
}

// SAFETY: the region is a plain byte allocation that never moves. All typed
// access goes through atomics or through ownership-checked views built on top.
unsafe impl Send for SharedRegion {}
// SAFETY: see above; `SharedRegion` exposes only raw pointers, never references
// to its contents.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates `len` zeroed bytes aligned to `alignment`.
    pub fn new_zeroed(len: usize, alignment: usize) -> TransportResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(backing) = Self::mmap_backed(len, alignment)? {
                return Ok(Self {
                    len,
                    alignment,
                    backing,
                });
            }
        }

        Self::heap_backed(len, alignment)
    }

    fn heap_backed(len: usize, alignment: usize) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            TransportError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        // SAFETY: `layout` has a non-zero size, checked above.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            backing: Backing::Owned { ptr, layout },
        })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mmap_backed(len: usize, alignment: usize) -> TransportResult<Option<Backing>> {
        let map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        // Anonymous mappings are zero-filled by the kernel.
        if map.as_ptr() as usize % alignment != 0 {
            tracing::debug!(len, alignment, "mmap misaligned, falling back to heap");
            return Ok(None);
        }
        Ok(Some(Backing::Native(map)))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Base pointer of the region. Valid for `len()` bytes until drop.
    pub fn base_ptr(&self) -> *mut u8 {
        self.backing.base()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            // SAFETY: `ptr` was produced by `alloc_zeroed` with this exact layout.
            unsafe {
                dealloc(ptr.as_ptr(), *layout);
            }
        }
    }
}
