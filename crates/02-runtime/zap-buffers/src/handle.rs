//! Buffer handles. Reclamation happens in `Drop`:
//!
//! * a shared region loses one reference when the last clone of its handle
//!   goes away;
//! * an exclusive region is freed when its handle goes away, unless it was
//!   transferred or unregistered first.

use std::sync::Arc;

use zerde::{BufferDescriptor, Ownership};

use crate::registry::RegistryInner;
use crate::view::{resolve_window, BufferView, BufferViewMut, Element};
use crate::{BufferError, BufferResult, OwnershipKind};

pub(crate) struct SharedInner {
    pub(crate) registry: Arc<RegistryInner>,
    pub(crate) descriptor: BufferDescriptor,
}

impl SharedInner {
    fn ref_id(&self) -> u32 {
        match self.descriptor.ownership {
            Ownership::Shared { ref_id } => ref_id,
            Ownership::Exclusive { .. } => 0,
        }
    }
}

impl Drop for SharedInner {
    fn drop(&mut self) {
        let ref_id = self.ref_id();
        {
            let mut cache = self.registry.shared.lock();
            let ours = cache
                .get(&ref_id)
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self as *const SharedInner));
            if ours {
                cache.remove(&ref_id);
            }
        }
        if let Err(err) = self.registry.executor.release_shared(ref_id) {
            tracing::error!("failed to release shared buffer {ref_id}: {err}");
        }
    }
}

/// Read-only, reference-counted buffer. Clones share one reference.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<SharedInner>,
}

impl SharedBuffer {
    pub(crate) fn from_inner(inner: Arc<SharedInner>) -> Self {
        Self { inner }
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.inner.descriptor
    }

    pub fn ref_id(&self) -> u32 {
        self.inner.ref_id()
    }

    pub fn byte_length(&self) -> u32 {
        self.inner.descriptor.byte_length
    }

    /// True when both handles are the same cached handle.
    pub fn same_handle(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Typed view. `byte_offset` is an absolute address, `length` counts elements.
    pub fn view<T: Element>(
        &self,
        byte_offset: Option<u32>,
        length: Option<u32>,
    ) -> BufferResult<BufferView<'_, T>> {
        let descriptor = self.inner.descriptor;
        let window = resolve_window::<T>(&descriptor, byte_offset, length)?;
        let memory = self.inner.registry.executor.memory();
        // SAFETY: shared regions are never written after they are shared.
        unsafe { BufferView::new(memory, descriptor, window) }
    }

    /// Descriptor for sending; the receiver gets its own reference.
    pub fn transfer(&self) -> BufferResult<BufferDescriptor> {
        self.inner.registry.executor.retain_shared(self.ref_id())?;
        Ok(self.inner.descriptor)
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("descriptor", &self.inner.descriptor)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExclusiveState {
    Live,
    Released,
}

/// Mutable buffer with exactly one owner.
pub struct ExclusiveBuffer {
    registry: Arc<RegistryInner>,
    descriptor: BufferDescriptor,
    state: ExclusiveState,
}

impl ExclusiveBuffer {
    pub(crate) fn new(registry: Arc<RegistryInner>, descriptor: BufferDescriptor) -> Self {
        Self {
            registry,
            descriptor,
            state: ExclusiveState::Live,
        }
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    pub fn byte_length(&self) -> u32 {
        self.descriptor.byte_length
    }

    pub fn is_live(&self) -> bool {
        self.state == ExclusiveState::Live
    }

    fn ensure_live(&self) -> BufferResult<()> {
        match self.state {
            ExclusiveState::Live => Ok(()),
            ExclusiveState::Released => Err(BufferError::UseAfterTransfer {
                base_pointer: self.descriptor.base_pointer,
            }),
        }
    }

    pub fn view<T: Element>(
        &self,
        byte_offset: Option<u32>,
        length: Option<u32>,
    ) -> BufferResult<BufferView<'_, T>> {
        self.ensure_live()?;
        let window = resolve_window::<T>(&self.descriptor, byte_offset, length)?;
        // SAFETY: only this handle owns the region and `&self` rules out a
        // concurrent `view_mut`.
        unsafe { BufferView::new(self.registry.executor.memory(), self.descriptor, window) }
    }

    pub fn view_mut<T: Element>(
        &mut self,
        byte_offset: Option<u32>,
        length: Option<u32>,
    ) -> BufferResult<BufferViewMut<'_, T>> {
        self.ensure_live()?;
        let window = resolve_window::<T>(&self.descriptor, byte_offset, length)?;
        // SAFETY: `&mut self` on the sole owner.
        unsafe { BufferViewMut::new(self.registry.executor.memory(), self.descriptor, window) }
    }

    /// Gives the region away. The handle is dead afterwards and will not free it.
    pub fn transfer(&mut self) -> BufferResult<BufferDescriptor> {
        self.ensure_live()?;
        self.state = ExclusiveState::Released;
        Ok(self.descriptor)
    }

    /// Forgets the region without freeing it; the other side keeps ownership.
    pub fn unregister(&mut self) -> BufferResult<()> {
        self.ensure_live()?;
        self.state = ExclusiveState::Released;
        Ok(())
    }
}

impl Drop for ExclusiveBuffer {
    fn drop(&mut self) {
        if self.state != ExclusiveState::Live {
            return;
        }
        let ptr = self.descriptor.base_pointer;
        if let Err(err) = self.registry.executor.dealloc(ptr) {
            tracing::error!("failed to free exclusive buffer at {ptr}: {err}");
        }
    }
}

impl std::fmt::Debug for ExclusiveBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveBuffer")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .finish()
    }
}

/// A wrapped descriptor of either kind.
#[derive(Debug)]
pub enum BufferHandle {
    Exclusive(ExclusiveBuffer),
    Shared(SharedBuffer),
}

impl BufferHandle {
    pub fn descriptor(&self) -> &BufferDescriptor {
        match self {
            BufferHandle::Exclusive(buffer) => buffer.descriptor(),
            BufferHandle::Shared(buffer) => buffer.descriptor(),
        }
    }

    pub fn kind(&self) -> OwnershipKind {
        match self {
            BufferHandle::Exclusive(_) => OwnershipKind::Exclusive,
            BufferHandle::Shared(_) => OwnershipKind::Shared,
        }
    }

    pub fn view<T: Element>(
        &self,
        byte_offset: Option<u32>,
        length: Option<u32>,
    ) -> BufferResult<BufferView<'_, T>> {
        match self {
            BufferHandle::Exclusive(buffer) => buffer.view(byte_offset, length),
            BufferHandle::Shared(buffer) => buffer.view(byte_offset, length),
        }
    }

    pub fn transfer(&mut self) -> BufferResult<BufferDescriptor> {
        match self {
            BufferHandle::Exclusive(buffer) => buffer.transfer(),
            BufferHandle::Shared(buffer) => buffer.transfer(),
        }
    }

    pub fn into_exclusive(self) -> BufferResult<ExclusiveBuffer> {
        match self {
            BufferHandle::Exclusive(buffer) => Ok(buffer),
            BufferHandle::Shared(_) => Err(BufferError::OwnershipMismatch {
                expected: OwnershipKind::Exclusive,
                actual: OwnershipKind::Shared,
            }),
        }
    }

    pub fn into_shared(self) -> BufferResult<SharedBuffer> {
        match self {
            BufferHandle::Shared(buffer) => Ok(buffer),
            BufferHandle::Exclusive(_) => Err(BufferError::OwnershipMismatch {
                expected: OwnershipKind::Shared,
                actual: OwnershipKind::Exclusive,
            }),
        }
    }
}
