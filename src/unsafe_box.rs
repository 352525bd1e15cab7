use std::ops::Deref;
use std::ptr::NonNull;

/// An owned heap allocation without the aliasing guarantees of `Box`.
///
/// Values of this type can be unsafely cloned and turned into raw pointers
/// that outlive any particular owner; the caller is responsible for making
/// sure the allocation is dropped exactly once.
pub(crate) struct UnsafeBox<T> {
    ptr: NonNull<T>,
}

impl<T> UnsafeBox<T> {
    /// Moves `value` to a new heap allocation.
    pub(crate) fn new(value: T) -> Self {
        Self {
            ptr: unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(value))) },
        }
    }

    /// Consumes this box, returning its raw pointer without deallocating.
    pub(crate) fn into_raw(this: Self) -> *mut T {
        this.ptr.as_ptr()
    }

    /// Rebuilds a box from a raw pointer.
    ///
    /// # Safety
    ///
    /// The pointer should come from `UnsafeBox::into_raw` and the allocation
    /// should still be live.
    pub(crate) unsafe fn from_raw(ptr: *mut T) -> Self {
        debug_assert!(!ptr.is_null());
        Self {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    /// Frees the allocation.
    ///
    /// # Safety
    ///
    /// The allocation should not be accessed through any pointer afterwards.
    pub(crate) unsafe fn drop(this: &mut Self) {
        drop(Box::from_raw(this.ptr.as_ptr()));
    }
}

impl<T> Deref for UnsafeBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}
