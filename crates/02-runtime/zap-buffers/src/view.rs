//! Typed, bounds-checked windows onto buffer memory.

use std::mem::size_of;
use std::ops::{Deref, DerefMut};

use transport::LinearMemory;
use zerde::{BufferDescriptor, ElementType};

use crate::{BufferError, BufferResult, OwnershipKind};

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u32 {}
    impl Sealed for f32 {}
}

/// Element types a buffer can hold.
pub trait Element: Copy + sealed::Sealed + 'static {
    const ELEMENT: ElementType;
}

impl Element for u8 {
    const ELEMENT: ElementType = ElementType::U8;
}

impl Element for u32 {
    const ELEMENT: ElementType = ElementType::U32;
}

impl Element for f32 {
    const ELEMENT: ElementType = ElementType::F32;
}

/// Absolute byte window `[offset, offset + len)` inside a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Window {
    pub offset: u32,
    pub len: u32,
}

/// Resolves an optional absolute byte offset and element length against
/// `descriptor`, defaulting to the whole region.
pub(crate) fn resolve_window<T: Element>(
    descriptor: &BufferDescriptor,
    byte_offset: Option<u32>,
    length: Option<u32>,
) -> BufferResult<Window> {
    if T::ELEMENT != descriptor.element_type {
        return Err(BufferError::TypeMismatch {
            expected: T::ELEMENT,
            actual: descriptor.element_type,
        });
    }
    let size = size_of::<T>() as u64;
    let base = descriptor.base_pointer as u64;
    let end = descriptor.end();
    let offset = byte_offset.map_or(base, u64::from);
    let byte_length = match length {
        Some(elements) => elements as u64 * size,
        None => end.saturating_sub(offset) / size * size,
    };
    if offset < base || offset + byte_length > end {
        return Err(BufferError::OutOfBounds {
            byte_offset: offset,
            byte_length,
            base: descriptor.base_pointer,
            len: descriptor.byte_length,
        });
    }
    Ok(Window {
        offset: offset as u32,
        len: byte_length as u32,
    })
}

/// Read-only typed view of buffer memory.
///
/// Views of exclusive buffers borrow the handle, so it cannot be transferred
/// while a view is alive.
#[derive(Debug)]
pub struct BufferView<'a, T: Element> {
    data: &'a [T],
    memory: &'a LinearMemory,
    descriptor: BufferDescriptor,
    window: Window,
}

impl<'a, T: Element> BufferView<'a, T> {
    /// # Safety
    /// Nobody may write the window while the view is alive.
    pub(crate) unsafe fn new(
        memory: &'a LinearMemory,
        descriptor: BufferDescriptor,
        window: Window,
    ) -> BufferResult<Self> {
        let count = window.len as usize / size_of::<T>();
        let data = memory.slice::<T>(window.offset, count)?;
        Ok(Self {
            data,
            memory,
            descriptor,
            window,
        })
    }

    /// Descriptor of the buffer this view belongs to.
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// Absolute address of the first viewed byte.
    pub fn byte_offset(&self) -> u32 {
        self.window.offset
    }

    pub fn byte_length(&self) -> u32 {
        self.window.len
    }

    /// The same bytes seen as another element type. For local use only:
    /// [`BufferView::check_type`] rejects the result.
    pub fn reinterpret<U: Element>(&self) -> BufferResult<BufferView<'a, U>> {
        if self.window.len as usize % size_of::<U>() != 0 {
            return Err(BufferError::ExtentMismatch {
                view_offset: self.window.offset,
                view_length: self.window.len,
                base: self.descriptor.base_pointer,
                len: self.descriptor.byte_length,
            });
        }
        let count = self.window.len as usize / size_of::<U>();
        // SAFETY: same window, still read-only for `'a`.
        let data = unsafe { self.memory.slice::<U>(self.window.offset, count)? };
        Ok(BufferView {
            data,
            memory: self.memory,
            descriptor: self.descriptor,
            window: self.window,
        })
    }

    /// Verifies the view is the full, correctly typed extent of a buffer with
    /// the expected ownership, i.e. safe to hand back across the boundary.
    pub fn check_type(&self, expected: OwnershipKind) -> BufferResult<()> {
        check_extent::<T>(&self.descriptor, self.window, expected)
    }
}

impl<T: Element> Deref for BufferView<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

/// Mutable typed view; only exclusive buffers hand these out.
#[derive(Debug)]
pub struct BufferViewMut<'a, T: Element> {
    data: &'a mut [T],
    descriptor: BufferDescriptor,
    window: Window,
}

impl<'a, T: Element> BufferViewMut<'a, T> {
    /// # Safety
    /// The caller must own the window exclusively while the view is alive.
    pub(crate) unsafe fn new(
        memory: &'a LinearMemory,
        descriptor: BufferDescriptor,
        window: Window,
    ) -> BufferResult<Self> {
        let count = window.len as usize / size_of::<T>();
        let data = memory.slice_mut::<T>(window.offset, count)?;
        Ok(Self {
            data,
            descriptor,
            window,
        })
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    pub fn byte_offset(&self) -> u32 {
        self.window.offset
    }

    pub fn byte_length(&self) -> u32 {
        self.window.len
    }

    pub fn check_type(&self, expected: OwnershipKind) -> BufferResult<()> {
        check_extent::<T>(&self.descriptor, self.window, expected)
    }
}

impl<T: Element> Deref for BufferViewMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

impl<T: Element> DerefMut for BufferViewMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data
    }
}

fn check_extent<T: Element>(
    descriptor: &BufferDescriptor,
    window: Window,
    expected: OwnershipKind,
) -> BufferResult<()> {
    if T::ELEMENT != descriptor.element_type {
        return Err(BufferError::TypeMismatch {
            expected: descriptor.element_type,
            actual: T::ELEMENT,
        });
    }
    if window.offset != descriptor.base_pointer || window.len != descriptor.byte_length {
        return Err(BufferError::ExtentMismatch {
            view_offset: window.offset,
            view_length: window.len,
            base: descriptor.base_pointer,
            len: descriptor.byte_length,
        });
    }
    let actual = if descriptor.is_shared() {
        OwnershipKind::Shared
    } else {
        OwnershipKind::Exclusive
    };
    if actual != expected {
        return Err(BufferError::OwnershipMismatch { expected, actual });
    }
    Ok(())
}
