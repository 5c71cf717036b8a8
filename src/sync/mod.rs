//! Cross-thread primitives.
//!
//! - [`FreeList`]: lock-free bounded object pool
//! - [`FdSem`]: eventfd-backed semaphore usable from signal handlers and `poll`
//! - [`Semaphore`]: blocking counting semaphore for non-realtime waiters
//! - [`AsyncQueue`]: bounded queue with poll integration
//! - [`AsyncMsgQ`]: message passing between the realtime and control contexts

mod asyncmsgq;
mod asyncq;
mod fdsem;
pub mod flist;
mod msgobject;
mod semaphore;

pub use asyncmsgq::{AsyncMsgQ, Delivery};
pub use asyncq::AsyncQueue;
pub use fdsem::FdSem;
pub use flist::FreeList;
pub use msgobject::{MESSAGE_SHUTDOWN, MsgObject, Userdata, dispatch};
pub use semaphore::Semaphore;
