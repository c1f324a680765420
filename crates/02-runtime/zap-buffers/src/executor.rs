//! The compute-side executor boundary and its in-process implementation.
//!
//! The host never allocates linear memory itself. Every allocation, shared
//! reference count change and compute-side call goes through an [`Executor`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use transport::{LinearMemory, MEMORY_ALIGNMENT};
use zerde::WireMessage;

use crate::{BufferError, BufferResult};

/// Linear memory size used by [`NativeExecutor::default_sized`].
pub const DEFAULT_MEMORY_BYTES: usize = 16 << 20;

/// Entry points the compute domain exposes to the host.
pub trait Executor: Send + Sync {
    /// The linear memory all addresses refer to.
    fn memory(&self) -> &LinearMemory;

    /// Allocates `bytes` bytes, 8-byte aligned. Never returns address 0.
    fn alloc(&self, bytes: u32) -> BufferResult<u32>;

    /// Moves an allocation to a region of `new_bytes`, preserving the common prefix.
    fn realloc(&self, ptr: u32, new_bytes: u32) -> BufferResult<u32>;

    /// Frees an allocation. Freeing twice is an ownership violation.
    fn dealloc(&self, ptr: u32) -> BufferResult<()>;

    /// Turns the allocation at `ptr` into a shared region with one reference.
    fn share(&self, ptr: u32, byte_length: u32) -> BufferResult<u32>;

    /// Adds one reference to a shared region.
    fn retain_shared(&self, ref_id: u32) -> BufferResult<()>;

    /// Drops one reference; the region is freed when the count reaches zero.
    fn release_shared(&self, ref_id: u32) -> BufferResult<()>;

    /// Runs a compute-side call: one encoded message in, one out.
    fn call(&self, message: WireMessage) -> BufferResult<WireMessage>;
}

/// Handler invoked by [`NativeExecutor::call`].
pub type CallHandler = dyn Fn(WireMessage) -> BufferResult<WireMessage> + Send + Sync;

#[derive(Debug, Default)]
struct Heap {
    /// start -> length of every free block, coalesced.
    free: BTreeMap<u32, u32>,
    /// start -> length of every live allocation.
    live: HashMap<u32, u32>,
}

impl Heap {
    fn new(size: u32) -> Self {
        let mut free = BTreeMap::new();
        let start = MEMORY_ALIGNMENT as u32;
        if size > start {
            free.insert(start, size - start);
        }
        Self {
            free,
            live: HashMap::new(),
        }
    }

    fn alloc(&mut self, bytes: u32) -> Option<u32> {
        let size = round_up(bytes.max(1))?;
        let (&start, &len) = self.free.iter().find(|(_, len)| **len >= size)?;
        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        self.live.insert(start, size);
        Some(start)
    }

    fn dealloc(&mut self, ptr: u32) -> Option<u32> {
        let size = self.live.remove(&ptr)?;
        let mut start = ptr;
        let mut len = size;
        if let Some((&prev, &prev_len)) = self.free.range(..ptr).next_back() {
            if prev + prev_len == ptr {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(ptr + size)) {
            len += next_len;
        }
        self.free.insert(start, len);
        Some(size)
    }
}

fn round_up(bytes: u32) -> Option<u32> {
    let align = MEMORY_ALIGNMENT as u32;
    bytes.checked_add(align - 1).map(|b| b & !(align - 1))
}

#[derive(Clone, Copy, Debug)]
struct SharedEntry {
    ptr: u32,
    count: u32,
}

/// In-process executor: a first-fit allocator over a [`LinearMemory`] plus a
/// shared reference table.
///
/// Every live allocation is tracked, so a second free of the same pointer, or
/// a free of something never allocated, is reported instead of corrupting
/// the heap.
pub struct NativeExecutor {
    memory: LinearMemory,
    heap: Mutex<Heap>,
    shared: Mutex<HashMap<u32, SharedEntry>>,
    next_ref: AtomicU32,
    handler: RwLock<Option<Arc<CallHandler>>>,
}

impl NativeExecutor {
    pub fn new(memory_bytes: usize) -> BufferResult<Self> {
        let memory = LinearMemory::new(memory_bytes)?;
        let heap = Heap::new(memory.size() as u32);
        Ok(Self {
            memory,
            heap: Mutex::new(heap),
            shared: Mutex::new(HashMap::new()),
            next_ref: AtomicU32::new(1),
            handler: RwLock::new(None),
        })
    }

    /// Executor over [`DEFAULT_MEMORY_BYTES`] of memory.
    pub fn default_sized() -> BufferResult<Self> {
        Self::new(DEFAULT_MEMORY_BYTES)
    }

    /// Installs the compute-side entry point used by [`Executor::call`].
    pub fn set_call_handler<F>(&self, handler: F)
    where
        F: Fn(WireMessage) -> BufferResult<WireMessage> + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Number of live allocations, shared regions included.
    pub fn live_allocations(&self) -> usize {
        self.heap.lock().live.len()
    }

    /// Current count of a shared region, `None` once it has been freed.
    pub fn shared_count(&self, ref_id: u32) -> Option<u32> {
        self.shared.lock().get(&ref_id).map(|entry| entry.count)
    }

    fn allocation_len(&self, ptr: u32) -> Option<u32> {
        self.heap.lock().live.get(&ptr).copied()
    }
}

impl std::fmt::Debug for NativeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeExecutor")
            .field("memory", &self.memory.size())
            .field("live_allocations", &self.live_allocations())
            .finish()
    }
}

impl Executor for NativeExecutor {
    fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    fn alloc(&self, bytes: u32) -> BufferResult<u32> {
        let ptr = self
            .heap
            .lock()
            .alloc(bytes)
            .ok_or(BufferError::OutOfMemory { requested: bytes })?;
        tracing::trace!(ptr, bytes, "alloc");
        Ok(ptr)
    }

    fn realloc(&self, ptr: u32, new_bytes: u32) -> BufferResult<u32> {
        if ptr == 0 {
            return self.alloc(new_bytes);
        }
        let old_len = self
            .allocation_len(ptr)
            .ok_or(BufferError::DoubleFree { ptr })?;
        let new_ptr = self.alloc(new_bytes)?;
        // SAFETY: both allocations are owned by the caller for the duration of
        // the move and do not overlap.
        unsafe {
            self.memory
                .copy_within(ptr, new_ptr, old_len.min(new_bytes) as usize)?;
        }
        self.dealloc(ptr)?;
        Ok(new_ptr)
    }

    fn dealloc(&self, ptr: u32) -> BufferResult<()> {
        match self.heap.lock().dealloc(ptr) {
            Some(bytes) => {
                tracing::trace!(ptr, bytes, "dealloc");
                Ok(())
            }
            None => Err(BufferError::DoubleFree { ptr }),
        }
    }

    fn share(&self, ptr: u32, byte_length: u32) -> BufferResult<u32> {
        let allocated = self
            .allocation_len(ptr)
            .ok_or(BufferError::DoubleFree { ptr })?;
        if byte_length > allocated {
            return Err(BufferError::OutOfBounds {
                byte_offset: ptr as u64,
                byte_length: byte_length as u64,
                base: ptr,
                len: allocated,
            });
        }
        let ref_id = self.next_ref.fetch_add(1, Ordering::Relaxed);
        self.shared
            .lock()
            .insert(ref_id, SharedEntry { ptr, count: 1 });
        Ok(ref_id)
    }

    fn retain_shared(&self, ref_id: u32) -> BufferResult<()> {
        let mut shared = self.shared.lock();
        let entry = shared
            .get_mut(&ref_id)
            .ok_or(BufferError::UnknownRef { ref_id })?;
        entry.count += 1;
        Ok(())
    }

    fn release_shared(&self, ref_id: u32) -> BufferResult<()> {
        let freed = {
            let mut shared = self.shared.lock();
            let entry = shared
                .get_mut(&ref_id)
                .ok_or(BufferError::UnknownRef { ref_id })?;
            entry.count -= 1;
            if entry.count == 0 {
                shared.remove(&ref_id).map(|entry| entry.ptr)
            } else {
                None
            }
        };
        if let Some(ptr) = freed {
            tracing::trace!(ref_id, ptr, "shared region freed");
            self.dealloc(ptr)?;
        }
        Ok(())
    }

    fn call(&self, message: WireMessage) -> BufferResult<WireMessage> {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(message),
            None => Err(BufferError::NoCallHandler),
        }
    }
}
