use std::{
    borrow::Borrow,
    error::Error,
    fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ops::Deref,
    ptr::{self, NonNull},
};

use static_assertions::const_assert_eq;

use crate::{block::ControlBlock, Teardown, TeardownFn};

/// A result of unsuccessful [`Handle::try_new`].
///
/// It returns the ownership of the object which was given as a parameter.
pub struct TransferError<T> {
    /// The object which could not be brought under management.
    pub object: Box<T>,
}

impl<T> TransferError<T> {
    #[inline]
    pub fn into_inner(self) -> Box<T> {
        self.object
    }
}

impl<T> fmt::Debug for TransferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for TransferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to allocate a control block")
    }
}

impl<T> Error for TransferError<T> {}

/// One share of ownership over a heap-allocated `T`.
///
/// Handles are created only by transferring an owned allocation into management, or by
/// cloning an existing handle. The object is torn down exactly once, when the last handle
/// referring to it is dropped.
///
/// Only the count is synchronized. Shared access to the object goes through `&T`, so
/// mutation needs interior mutability chosen by the caller.
///
/// Ownership must be transferred. None of these compile:
///
/// ```compile_fail
/// use shared_handle::Handle;
/// let five = 5;
/// let h = Handle::new(&five);
/// ```
///
/// ```compile_fail
/// use shared_handle::Handle;
/// let mut five = 5;
/// let h = Handle::new(&mut five);
/// ```
///
/// ```compile_fail
/// use shared_handle::Handle;
/// let h = Handle::new(5);
/// ```
///
/// ```compile_fail
/// use shared_handle::Handle;
/// let b = Box::new(5);
/// let h = Handle::new(b);
/// let read = *b; // `b` was moved into the handle
/// ```
///
/// ```compile_fail
/// use shared_handle::Handle;
/// let b = Box::new(5);
/// let h = Handle::new(&b);
/// ```
pub struct Handle<T> {
    block: NonNull<ControlBlock<T>>,
    _marker: PhantomData<ControlBlock<T>>,
}

unsafe impl<T: Send + Sync> Send for Handle<T> {}
unsafe impl<T: Send + Sync> Sync for Handle<T> {}

// An empty slot costs nothing: `Option<Handle<T>>` is the moved-from state.
const_assert_eq!(
    mem::size_of::<Option<Handle<u8>>>(),
    mem::size_of::<usize>()
);

impl<T> Handle<T> {
    #[inline]
    fn from_block(block: NonNull<ControlBlock<T>>) -> Self {
        Self {
            block,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    fn block(&self) -> &ControlBlock<T> {
        // SAFETY: a live handle keeps the count at 1 or above, so the block is alive.
        unsafe { self.block.as_ref() }
    }

    /// Takes ownership of `object`. It is dropped normally when the last handle goes away.
    ///
    /// ```
    /// use shared_handle::Handle;
    ///
    /// let h = Handle::new(Box::new(5));
    /// assert_eq!(*h, 5);
    /// assert_eq!(h.ref_count(), 1);
    /// ```
    #[inline]
    pub fn new(object: Box<T>) -> Self {
        Self::from_block(ControlBlock::new(object, Teardown::Drop))
    }

    /// Takes ownership of `object`. `teardown` runs on it instead of `Drop` when the last
    /// handle goes away.
    #[inline]
    pub fn with_teardown(object: Box<T>, teardown: TeardownFn<T>) -> Self {
        Self::from_block(ControlBlock::new(object, Teardown::Custom(teardown)))
    }

    /// Takes ownership of `object`, reporting a failed control-block allocation instead of
    /// aborting. On failure nothing is managed and the object is handed back.
    pub fn try_new(object: Box<T>, teardown: Teardown<T>) -> Result<Self, TransferError<T>> {
        match ControlBlock::try_new(object, teardown) {
            Ok(block) => Ok(Self::from_block(block)),
            Err(object) => Err(TransferError { object }),
        }
    }

    /// Moves the object out of `slot`, which is left `None`.
    ///
    /// Returns `None` if the slot was already empty.
    ///
    /// ```
    /// use shared_handle::Handle;
    ///
    /// let mut data = Some(Box::new(5));
    /// let h = Handle::transfer(&mut data).unwrap();
    /// assert!(data.is_none());
    /// assert_eq!(*h, 5);
    /// ```
    #[inline]
    pub fn transfer(slot: &mut Option<Box<T>>) -> Option<Self> {
        slot.take().map(Self::new)
    }

    /// [`Handle::transfer`] with a custom teardown.
    #[inline]
    pub fn transfer_with_teardown(
        slot: &mut Option<Box<T>>,
        teardown: TeardownFn<T>,
    ) -> Option<Self> {
        slot.take().map(|object| Self::with_teardown(object, teardown))
    }

    /// Takes ownership of the allocation behind `*raw` and nulls `*raw`.
    ///
    /// Returns `None` if `*raw` was already null.
    ///
    /// # Safety
    ///
    /// A non-null `*raw` must come from [`Box::into_raw`], and nothing else may free or
    /// reclaim it afterwards.
    pub unsafe fn from_raw_transfer(raw: &mut *mut T, teardown: Teardown<T>) -> Option<Self> {
        let ptr = mem::replace(raw, ptr::null_mut());
        if ptr.is_null() {
            return None;
        }
        Some(Self::from_block(ControlBlock::new(
            Box::from_raw(ptr),
            teardown,
        )))
    }

    /// How many handles refer to this object.
    ///
    /// Other threads may clone or drop handles at any time, so the value is meant for
    /// diagnostics and tests rather than for synchronization.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.block().count()
    }

    /// The managed object. Same as dereferencing the handle.
    #[inline]
    pub fn get(&self) -> &T {
        self.block().object()
    }

    /// Mutable access, if this is the only handle.
    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.ref_count() == 1 {
            // SAFETY: the count is 1 and we hold `&mut self`, so no other handle exists
            // and none can be cloned from this one while the borrow lives.
            Some(unsafe { self.block().object_mut() })
        } else {
            None
        }
    }

    /// Whether both handles manage the same object.
    #[inline]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }

    /// Address of the managed object.
    #[inline]
    pub fn as_ptr(this: &Self) -> *const T {
        this.block().object_ptr()
    }

    /// Gives up this share of ownership.
    ///
    /// Returns `true` if this was the last handle, in which case the object has been torn
    /// down when the call returns.
    #[inline]
    pub fn release(self) -> bool {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is not used after its share is given up.
        unsafe { Self::release_block(this.block) }
    }

    /// # Safety
    ///
    /// `block` must be the block of a handle whose share is given up by this call.
    #[inline]
    unsafe fn release_block(block: NonNull<ControlBlock<T>>) -> bool {
        if block.as_ref().decrement() == 1 {
            ControlBlock::destroy(block);
            true
        } else {
            false
        }
    }
}

impl<T> Clone for Handle<T> {
    /// Shares the object with one more handle.
    #[inline]
    fn clone(&self) -> Self {
        // The count goes up before the new handle adopts the block.
        self.block().increment();
        Self::from_block(self.block)
    }

    /// A no-op when both handles already share the object.
    #[inline]
    fn clone_from(&mut self, source: &Self) {
        if !Self::ptr_eq(self, source) {
            *self = source.clone();
        }
    }
}

impl<T> Drop for Handle<T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: `self` is never used again.
        unsafe { Self::release_block(self.block) };
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T> AsRef<T> for Handle<T> {
    #[inline]
    fn as_ref(&self) -> &T {
        self.get()
    }
}

impl<T> Borrow<T> for Handle<T> {
    #[inline]
    fn borrow(&self) -> &T {
        self.get()
    }
}

impl<T: PartialEq> PartialEq for Handle<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<T: Eq> Eq for Handle<T> {}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.get(), f)
    }
}

impl<T: fmt::Display> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.get(), f)
    }
}

impl<T> fmt::Pointer for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&Self::as_ptr(self), f)
    }
}
