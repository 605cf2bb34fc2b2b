use std::fmt;

/// A custom destruction routine.
///
/// It receives sole ownership of the managed allocation and decides what happens to it:
/// drop it, hand it to a pool, or release an external resource it wraps.
pub type TeardownFn<T> = fn(Box<T>);

/// How the managed object is destroyed once the last [`Handle`](crate::Handle) is gone.
pub enum Teardown<T> {
    /// Plain `Drop` of the boxed object.
    Drop,
    /// The given function runs instead of `Drop`.
    Custom(TeardownFn<T>),
}

impl<T> Teardown<T> {
    #[inline]
    pub fn is_custom(&self) -> bool {
        matches!(self, Teardown::Custom(_))
    }

    /// Destroys `object` through exactly one of the two paths.
    #[inline]
    pub fn run(self, object: Box<T>) {
        match self {
            Teardown::Drop => drop(object),
            Teardown::Custom(f) => f(object),
        }
    }
}

// Derives would require `T: Clone`.
impl<T> Clone for Teardown<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Teardown<T> {}

impl<T> Default for Teardown<T> {
    #[inline]
    fn default() -> Self {
        Teardown::Drop
    }
}

impl<T> From<TeardownFn<T>> for Teardown<T> {
    #[inline]
    fn from(f: TeardownFn<T>) -> Self {
        Teardown::Custom(f)
    }
}

impl<T> fmt::Debug for Teardown<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Teardown::Drop => write!(f, "Drop"),
            Teardown::Custom(func) => write!(f, "Custom({:p})", *func as *const ()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{Teardown, TeardownFn};

    static RECYCLED: AtomicUsize = AtomicUsize::new(0);

    struct Tracked<'a>(&'a AtomicUsize);

    impl Drop for Tracked<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn recycle(obj: Box<usize>) {
        RECYCLED.fetch_add(*obj, Ordering::Relaxed);
    }

    #[test]
    fn default_is_drop() {
        let drops = AtomicUsize::new(0);
        let teardown = Teardown::default();
        assert!(!teardown.is_custom());
        teardown.run(Box::new(Tracked(&drops)));
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn custom_replaces_drop() {
        let teardown = Teardown::from(recycle as TeardownFn<usize>);
        assert!(teardown.is_custom());
        let copy = teardown;
        teardown.run(Box::new(3));
        copy.run(Box::new(4));
        assert_eq!(RECYCLED.load(Ordering::Relaxed), 7);
    }
}
