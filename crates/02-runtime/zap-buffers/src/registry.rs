use std::collections::HashMap;
use std::mem::size_of_val;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use zerde::{BufferDescriptor, Ownership};

use crate::handle::{BufferHandle, ExclusiveBuffer, SharedBuffer, SharedInner};
use crate::view::Element;
use crate::{BufferError, BufferResult, Executor};

pub(crate) struct RegistryInner {
    pub(crate) executor: Arc<dyn Executor>,
    /// Live shared handles by `ref_id`. Entries are removed by the handle's
    /// last drop, and only if they still point at that handle.
    pub(crate) shared: Mutex<HashMap<u32, Weak<SharedInner>>>,
}

/// Host-side owner of buffer handles for one executor.
///
/// Shared descriptors wrap to one stable handle per `ref_id`; exclusive
/// descriptors wrap to a fresh handle every time.
#[derive(Clone)]
pub struct BufferRegistry {
    inner: Arc<RegistryInner>,
}

impl BufferRegistry {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                executor,
                shared: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    /// Number of shared handles currently alive.
    pub fn live_shared(&self) -> usize {
        self.inner
            .shared
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Wraps a received descriptor, taking over the reference or allocation it carries.
    pub fn wrap(&self, descriptor: BufferDescriptor) -> BufferResult<BufferHandle> {
        Ok(match descriptor.ownership {
            Ownership::Shared { .. } => BufferHandle::Shared(self.wrap_shared(descriptor)?),
            Ownership::Exclusive { .. } => {
                BufferHandle::Exclusive(self.wrap_exclusive(descriptor)?)
            }
        })
    }

    pub fn wrap_shared(&self, descriptor: BufferDescriptor) -> BufferResult<SharedBuffer> {
        let Ownership::Shared { ref_id } = descriptor.ownership else {
            return Err(BufferError::OwnershipMismatch {
                expected: crate::OwnershipKind::Shared,
                actual: crate::OwnershipKind::Exclusive,
            });
        };
        self.check_in_memory(&descriptor)?;

        let mut cache = self.inner.shared.lock();
        if let Some(existing) = cache.get(&ref_id).and_then(Weak::upgrade) {
            drop(cache);
            // The sender counted a reference for this descriptor; our cached
            // handle already holds one, so hand the extra back.
            self.inner.executor.release_shared(ref_id)?;
            if existing.descriptor != descriptor {
                return Err(BufferError::DescriptorConflict { ref_id });
            }
            return Ok(SharedBuffer::from_inner(existing));
        }
        let inner = Arc::new(SharedInner {
            registry: Arc::clone(&self.inner),
            descriptor,
        });
        cache.insert(ref_id, Arc::downgrade(&inner));
        Ok(SharedBuffer::from_inner(inner))
    }

    pub fn wrap_exclusive(&self, descriptor: BufferDescriptor) -> BufferResult<ExclusiveBuffer> {
        if descriptor.is_shared() {
            return Err(BufferError::OwnershipMismatch {
                expected: crate::OwnershipKind::Exclusive,
                actual: crate::OwnershipKind::Shared,
            });
        }
        self.check_in_memory(&descriptor)?;
        Ok(ExclusiveBuffer::new(Arc::clone(&self.inner), descriptor))
    }

    /// Allocates an exclusive buffer holding a copy of `data`.
    pub fn alloc_exclusive<T: Element>(&self, data: &[T]) -> BufferResult<ExclusiveBuffer> {
        let byte_length = byte_len(data)?;
        let ptr = self.alloc_filled(data)?;
        self.wrap_exclusive(BufferDescriptor {
            base_pointer: ptr,
            byte_length,
            element_type: T::ELEMENT,
            ownership: Ownership::Exclusive {
                capacity: byte_length,
            },
        })
    }

    /// Allocates a shared buffer holding a copy of `data`, with one reference.
    pub fn alloc_shared<T: Element>(&self, data: &[T]) -> BufferResult<SharedBuffer> {
        let byte_length = byte_len(data)?;
        let ptr = self.alloc_filled(data)?;
        let ref_id = match self.inner.executor.share(ptr, byte_length) {
            Ok(ref_id) => ref_id,
            Err(err) => {
                let _ = self.inner.executor.dealloc(ptr);
                return Err(err);
            }
        };
        self.wrap_shared(BufferDescriptor {
            base_pointer: ptr,
            byte_length,
            element_type: T::ELEMENT,
            ownership: Ownership::Shared { ref_id },
        })
    }

    fn alloc_filled<T: Element>(&self, data: &[T]) -> BufferResult<u32> {
        let executor = &self.inner.executor;
        let ptr = executor.alloc(byte_len(data)?)?;
        // SAFETY: the allocation is fresh and nobody else knows its address yet.
        let filled = unsafe { executor.memory().slice_mut::<T>(ptr, data.len()) }
            .map(|dst| dst.copy_from_slice(data));
        if let Err(err) = filled {
            let _ = executor.dealloc(ptr);
            return Err(err.into());
        }
        Ok(ptr)
    }

    fn check_in_memory(&self, descriptor: &BufferDescriptor) -> BufferResult<()> {
        self.inner
            .executor
            .memory()
            .check_range(descriptor.base_pointer, descriptor.byte_length as usize)?;
        Ok(())
    }
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("live_shared", &self.live_shared())
            .finish()
    }
}

fn byte_len<T>(data: &[T]) -> BufferResult<u32> {
    let bytes = size_of_val(data);
    u32::try_from(bytes).map_err(|_| BufferError::OutOfMemory { requested: u32::MAX })
}
