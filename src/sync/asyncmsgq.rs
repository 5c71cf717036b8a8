//! Asynchronous message queue between the realtime and control contexts.
//!
//! An [`AsyncMsgQ`] carries `(target, code, userdata, chunk)` messages from
//! any number of producers to one consumer, in order, exactly once.
//!
//! - [`post`](AsyncMsgQ::post) enqueues and returns; it blocks only while
//!   the queue is full.
//! - [`send`](AsyncMsgQ::send) enqueues and blocks until the consumer
//!   acknowledges, returning the consumer's result. Never call it from a
//!   realtime thread.
//! - [`get`](AsyncMsgQ::get) hands the consumer a [`Delivery`]; exactly one
//!   [`done`](Delivery::done) follows each successful `get`.
//!
//! Enqueueing takes one reference on the target and one on the chunk's
//! block. Acknowledging releases exactly those, whichever path the message
//! took. Message items are recycled through a [`FreeList`] filled at
//! construction, so `post` does not allocate while the pool has items.
//!
//! # Example
//!
//! ```rust
//! use sonance::sync::AsyncMsgQ;
//!
//! let q = AsyncMsgQ::new(16).unwrap();
//! q.post(None, 1, Some(Box::new(42u32)), None);
//!
//! let delivery = q.get(false).unwrap();
//! assert_eq!(delivery.code(), 1);
//! assert_eq!(delivery.userdata_ref::<u32>(), Some(&42));
//! delivery.done(0);
//! ```

use crate::config::QueueConfig;
use crate::error::Result;
use crate::memory::MemChunk;
use crate::observability::{QueueMetrics, instrument_queue};
use crate::sync::{AsyncQueue, FreeList, MsgObject, Semaphore, Userdata, dispatch};
use std::any::Any;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Where a `send` waits for its acknowledgement.
struct ReplySlot {
    result: AtomicI32,
    userdata: Mutex<Option<Userdata>>,
    sem: Semaphore,
}

impl ReplySlot {
    fn new() -> Self {
        Self {
            result: AtomicI32::new(-1),
            userdata: Mutex::new(None),
            sem: Semaphore::new(0),
        }
    }

    fn fill(&self, result: i32, userdata: Option<Userdata>) {
        self.result.store(result, Ordering::Release);
        *self.userdata.lock().unwrap_or_else(PoisonError::into_inner) = userdata;
    }
}

/// One message in flight.
#[derive(Default)]
struct Message {
    code: i32,
    object: Option<Arc<dyn MsgObject>>,
    userdata: Option<Userdata>,
    chunk: Option<MemChunk>,
    reply: Option<Arc<ReplySlot>>,
}

impl Message {
    /// Release every reference the message holds.
    ///
    /// For sends, the result and the userdata go to the reply slot, which is
    /// returned so the caller can wake the sender once it is done with the
    /// item.
    fn complete(self, result: i32) -> Option<Arc<ReplySlot>> {
        let Message {
            object,
            userdata,
            chunk,
            reply,
            ..
        } = self;

        match reply {
            Some(reply) => {
                drop(object);
                drop(chunk);
                reply.fill(result, userdata);
                Some(reply)
            }
            None => {
                drop(userdata);
                drop(object);
                drop(chunk);
                None
            }
        }
    }
}

/// Bounded, ordered, exactly-once message queue.
pub struct AsyncMsgQ {
    queue: AsyncQueue<Box<Message>>,
    /// Empty message shells for reuse.
    pool: FreeList<Box<Message>>,
    /// Set while a delivery is outstanding.
    current: AtomicBool,
    metrics: QueueMetrics,
}

impl AsyncMsgQ {
    /// Create a queue holding up to `capacity` pending messages.
    ///
    /// `0` selects the default capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(QueueConfig::with_capacity(capacity))
    }

    /// Create a queue from a config.
    pub fn with_config(config: QueueConfig) -> Result<Self> {
        let pool = FreeList::new(config.item_pool);
        for _ in 0..pool.capacity() {
            if pool.push(Box::default()).is_err() {
                break;
            }
        }

        Ok(Self {
            queue: AsyncQueue::new(config.capacity)?,
            pool,
            current: AtomicBool::new(false),
            metrics: QueueMetrics::new(&config.name),
        })
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        self.metrics.name()
    }

    /// Maximum number of pending messages.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of pending messages (snapshot).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is pending (snapshot).
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn make_message(
        &self,
        object: Option<&Arc<dyn MsgObject>>,
        code: i32,
        userdata: Option<Userdata>,
        chunk: Option<&MemChunk>,
        reply: Option<Arc<ReplySlot>>,
    ) -> Box<Message> {
        let mut message = self.pool.pop().unwrap_or_default();
        message.code = code;
        message.object = object.cloned();
        message.userdata = userdata;
        message.chunk = chunk.cloned();
        message.reply = reply;
        message
    }

    fn recycle(&self, shell: Box<Message>) {
        // Full pool: the shell goes back to the heap.
        let _ = self.pool.push(shell);
    }

    /// Enqueue a message and return immediately.
    ///
    /// Takes a reference on `object` and on the chunk's block. `userdata` is
    /// dropped when the consumer acknowledges the message. Blocks only while
    /// the queue is full.
    pub fn post(
        &self,
        object: Option<&Arc<dyn MsgObject>>,
        code: i32,
        userdata: Option<Userdata>,
        chunk: Option<&MemChunk>,
    ) {
        let message = self.make_message(object, code, userdata, chunk, None);
        self.queue.push(message);
    }

    /// Enqueue a message and block until the consumer acknowledges it.
    ///
    /// Returns the value passed to [`Delivery::done`].
    pub fn send(
        &self,
        object: Option<&Arc<dyn MsgObject>>,
        code: i32,
        userdata: Option<Userdata>,
        chunk: Option<&MemChunk>,
    ) -> i32 {
        self.send_returning(object, code, userdata, chunk).0
    }

    /// Like [`send`](Self::send), but also hands the userdata back so the
    /// consumer can return data through it.
    pub fn send_returning(
        &self,
        object: Option<&Arc<dyn MsgObject>>,
        code: i32,
        userdata: Option<Userdata>,
        chunk: Option<&MemChunk>,
    ) -> (i32, Option<Userdata>) {
        let reply = Arc::new(ReplySlot::new());
        let message = self.make_message(object, code, userdata, chunk, Some(Arc::clone(&reply)));

        self.queue.push(message);
        self.metrics.record_depth(self.queue.len());

        reply.sem.wait();
        self.metrics.record_sent();

        let result = reply.result.load(Ordering::Acquire);
        let userdata = reply
            .userdata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        (result, userdata)
    }

    /// Dequeue the oldest message.
    ///
    /// With `wait` the call sleeps until a message arrives; without it the
    /// call never blocks.
    ///
    /// # Panics
    ///
    /// Panics if the previous delivery is still outstanding.
    pub fn get(&self, wait: bool) -> Option<Delivery<'_>> {
        let busy = self.current.swap(true, Ordering::AcqRel);
        assert!(!busy, "get() while a previous delivery is outstanding");

        let Some(mut shell) = self.queue.pop(wait) else {
            self.current.store(false, Ordering::Release);
            return None;
        };

        let message = std::mem::take(&mut *shell);
        Some(Delivery {
            queue: self,
            message,
            shell: Some(shell),
        })
    }

    /// Consume and acknowledge messages until one with `code` arrives.
    ///
    /// Every message, including the matching one, is acknowledged with 0.
    pub fn wait_for(&self, code: i32) {
        let _span = instrument_queue(self.name());
        loop {
            let Some(delivery) = self.get(true) else {
                continue;
            };
            let seen = delivery.code();
            delivery.done(0);
            if seen == code {
                tracing::debug!(code, "wait_for matched");
                return;
            }
        }
    }

    /// Dispatch every pending message to its target without blocking.
    ///
    /// Returns the number of messages processed.
    pub fn process_pending(&self) -> usize {
        let mut processed = 0;
        while let Some(delivery) = self.get(false) {
            delivery.dispatch();
            processed += 1;
        }
        processed
    }

    /// Descriptor that turns readable when messages arrive while armed.
    pub fn get_fd(&self) -> BorrowedFd<'_> {
        self.queue.get_fd()
    }

    /// Arm the descriptor before sleeping in `poll`.
    ///
    /// Returns `false` if messages are already pending (do not sleep);
    /// `true` once armed, in which case [`after_poll`](Self::after_poll)
    /// must follow.
    pub fn before_poll(&self) -> bool {
        self.queue.read_before_poll()
    }

    /// Disarm after `poll` returned.
    pub fn after_poll(&self) {
        self.queue.read_after_poll();
    }

    /// Wait on the tokio reactor until a message is pending.
    ///
    /// Only the consumer may call this, and only one call may be in flight.
    pub async fn readable(&self) -> Result<()> {
        use tokio::io::Interest;
        use tokio::io::unix::AsyncFd;

        let async_fd = AsyncFd::with_interest(self.get_fd(), Interest::READABLE)?;

        loop {
            if !self.before_poll() {
                return Ok(());
            }

            let armed = PollArmed(self);
            let mut guard = async_fd.readable().await?;
            drop(armed);
            guard.clear_ready();

            if !self.is_empty() {
                return Ok(());
            }
        }
    }
}

/// Pairs `before_poll` with `after_poll`, including on cancellation.
struct PollArmed<'a>(&'a AsyncMsgQ);

impl Drop for PollArmed<'_> {
    fn drop(&mut self) {
        self.0.after_poll();
    }
}

impl Drop for AsyncMsgQ {
    fn drop(&mut self) {
        let mut drained = 0;
        while let Some(mut shell) = self.queue.pop(false) {
            if let Some(reply) = std::mem::take(&mut *shell).complete(-1) {
                reply.sem.post();
            }
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(queue = %self.name(), drained, "released undelivered messages");
            self.metrics.record_drained(drained);
        }
    }
}

impl std::fmt::Debug for AsyncMsgQ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncMsgQ")
            .field("name", &self.name())
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// A dequeued message awaiting acknowledgement.
///
/// Call [`done`](Self::done) or [`dispatch`](Self::dispatch) exactly once.
/// Dropping a delivery without either acknowledges it with `-1`.
pub struct Delivery<'a> {
    queue: &'a AsyncMsgQ,
    message: Message,
    shell: Option<Box<Message>>,
}

impl Delivery<'_> {
    /// Message opcode.
    pub fn code(&self) -> i32 {
        self.message.code
    }

    /// Message target.
    pub fn object(&self) -> Option<&Arc<dyn MsgObject>> {
        self.message.object.as_ref()
    }

    /// Attached chunk.
    pub fn chunk(&self) -> Option<&MemChunk> {
        self.message.chunk.as_ref()
    }

    /// Attached userdata.
    pub fn userdata(&self) -> Option<&(dyn Any + Send)> {
        self.message.userdata.as_deref()
    }

    /// Attached userdata, if it is a `T`.
    pub fn userdata_ref<T: Any>(&self) -> Option<&T> {
        self.userdata().and_then(|u| u.downcast_ref::<T>())
    }

    /// Attached userdata, mutably, if it is a `T`.
    ///
    /// For sends, changes are visible to the sender via
    /// [`AsyncMsgQ::send_returning`].
    pub fn userdata_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.message
            .userdata
            .as_deref_mut()
            .and_then(|u| u.downcast_mut::<T>())
    }

    /// Returns true if a sender is blocked waiting for this message.
    pub fn is_send(&self) -> bool {
        self.message.reply.is_some()
    }

    /// Acknowledge the message with `result`.
    pub fn done(mut self, result: i32) {
        self.finish(result);
    }

    /// Run the target's `process_msg` and acknowledge with its return value.
    pub fn dispatch(mut self) -> i32 {
        let message = &mut self.message;
        let result = dispatch(
            message.object.as_ref(),
            message.code,
            message.userdata.as_deref_mut(),
            message.chunk.as_ref(),
        );
        self.finish(result);
        result
    }

    fn finish(&mut self, result: i32) {
        let Some(shell) = self.shell.take() else {
            return;
        };

        let reply = std::mem::take(&mut self.message).complete(result);
        self.queue.recycle(shell);
        self.queue.current.store(false, Ordering::Release);

        if let Some(reply) = reply {
            reply.sem.post();
        }
    }
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        self.finish(-1);
    }
}

impl std::fmt::Debug for Delivery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("code", &self.code())
            .field("has_object", &self.message.object.is_some())
            .field("has_chunk", &self.message.chunk.is_some())
            .field("is_send", &self.is_send())
            .finish()
    }
}
