//! A reference-counted shared-ownership handle for a single heap-allocated object.
//!
//! A [`Handle`] is created by transferring an owned allocation into management, optionally
//! with a custom [`Teardown`]. Cloning a handle bumps an atomic count in the shared control
//! block; the handle whose drop takes the count from 1 to 0 tears the object down.
//!
//! ```
//! use shared_handle::Handle;
//!
//! let sp = Handle::new(Box::new(5));
//! {
//!     let copy = sp.clone();
//!     assert_eq!(copy.ref_count(), 2);
//!     assert_eq!(*copy, 5);
//! }
//! assert_eq!(sp.ref_count(), 1);
//! ```

mod block;
pub mod config;
mod handle;
mod teardown;

pub use handle::{Handle, TransferError};
pub use teardown::{Teardown, TeardownFn};
