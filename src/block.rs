use std::{
    alloc::{alloc, Layout},
    process::abort,
    ptr::NonNull,
    sync::atomic::{fence, AtomicUsize, Ordering},
};

use log::trace;

use crate::Teardown;

/// A soft limit on the amount of references that may be made to a block.
///
/// Going above this limit aborts the program, as the counter would otherwise be able to
/// wrap around to zero while handles are still alive.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// The single allocation shared by every handle descended from one transfer.
///
/// A block never moves and is never copied. Handles refer to it through a `NonNull`,
/// and the handle whose decrement observes the count leaving 1 is the one that destroys it.
pub(crate) struct ControlBlock<T> {
    /// Exclusively owned by the block; came from `Box::into_raw`.
    object: NonNull<T>,
    count: AtomicUsize,
    teardown: Teardown<T>,
}

impl<T> ControlBlock<T> {
    #[inline]
    fn init(object: Box<T>, teardown: Teardown<T>) -> Self {
        Self {
            // SAFETY: `Box::into_raw` never returns null.
            object: unsafe { NonNull::new_unchecked(Box::into_raw(object)) },
            count: AtomicUsize::new(1),
            teardown,
        }
    }

    /// Allocates a block owning `object` with a count of 1.
    #[inline]
    pub(crate) fn new(object: Box<T>, teardown: Teardown<T>) -> NonNull<Self> {
        let block = NonNull::from(Box::leak(Box::new(Self::init(object, teardown))));
        trace!("created control block {:p}", block);
        block
    }

    /// Like [`ControlBlock::new`], but gives `object` back if the block cannot be allocated.
    pub(crate) fn try_new(object: Box<T>, teardown: Teardown<T>) -> Result<NonNull<Self>, Box<T>> {
        let layout = Layout::new::<Self>();
        // SAFETY: `Self` holds a pointer and a counter, so the layout is never zero-sized.
        let Some(block) = NonNull::new(unsafe { alloc(layout) }.cast::<Self>()) else {
            trace!("control block allocation of {} bytes failed", layout.size());
            return Err(object);
        };
        // SAFETY: freshly allocated with the layout of `Self`, which is also the layout
        // `Box<Self>` frees with in `destroy`.
        unsafe { block.as_ptr().write(Self::init(object, teardown)) };
        trace!("created control block {:p}", block);
        Ok(block)
    }

    #[inline]
    pub(crate) fn object(&self) -> &T {
        // SAFETY: the object lives as long as the block.
        unsafe { self.object.as_ref() }
    }

    /// # Safety
    ///
    /// The caller must be the only one able to reach the object for the returned lifetime.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn object_mut(&self) -> &mut T {
        &mut *self.object.as_ptr()
    }

    #[inline]
    pub(crate) fn object_ptr(&self) -> *const T {
        self.object.as_ptr()
    }

    /// A snapshot of the count; stale as soon as it returns if other threads hold handles.
    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Only ever called through a live handle, so the count cannot be zero here.
    #[inline]
    pub(crate) fn increment(&self) {
        // A new reference can only come from an existing one, which keeps the block alive.
        // No ordering with other memory is needed.
        let old = self.count.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            abort();
        }
    }

    /// Returns the count before the decrement. A result of 1 hands the caller the duty of
    /// calling [`ControlBlock::destroy`].
    #[inline]
    pub(crate) fn decrement(&self) -> usize {
        // Release orders every use of the object through this handle before the decrement.
        // The matching acquire is in `destroy`.
        self.count.fetch_sub(1, Ordering::Release)
    }

    /// Tears the object down and frees the block.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, by the caller whose [`ControlBlock::decrement`] returned 1.
    /// `this` is dangling afterwards.
    pub(crate) unsafe fn destroy(this: NonNull<Self>) {
        fence(Ordering::Acquire);

        let block = Box::from_raw(this.as_ptr());
        trace!(
            "destroying control block {:p} with {:?} teardown",
            this,
            block.teardown
        );
        // If the teardown unwinds, `block` is still freed; the object belongs to the teardown.
        block.teardown.run(Box::from_raw(block.object.as_ptr()));
        drop(block);
    }
}
