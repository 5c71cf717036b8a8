//! Message targets.
//!
//! A [`MsgObject`] is anything a message queue can deliver to. Targets are
//! shared as `Arc<dyn MsgObject>`: posting a message clones the `Arc`, and
//! acknowledging the message drops that clone again.

use crate::memory::MemChunk;
use std::any::Any;
use std::sync::Arc;

/// Opaque payload travelling with a message.
///
/// Its destructor is the message's free callback: it runs when the consumer
/// acknowledges a posted message.
pub type Userdata = Box<dyn Any + Send>;

/// Conventional opcode asking the consumer loop to stop.
pub const MESSAGE_SHUTDOWN: i32 = -1;

/// A reference-counted message target.
pub trait MsgObject: Send + Sync {
    /// Handle one message and return its result code.
    ///
    /// For `send`-originated messages the return value becomes the sender's
    /// result; for posts it is discarded.
    fn process_msg(
        &self,
        code: i32,
        userdata: Option<&mut (dyn Any + Send)>,
        chunk: Option<&MemChunk>,
    ) -> i32;
}

/// Route a message to its target. Messages without a target yield 0.
pub fn dispatch(
    object: Option<&Arc<dyn MsgObject>>,
    code: i32,
    userdata: Option<&mut (dyn Any + Send)>,
    chunk: Option<&MemChunk>,
) -> i32 {
    object.map_or(0, |o| o.process_msg(code, userdata, chunk))
}
