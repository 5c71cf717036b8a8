//! End-to-end tests for the message queue between a "realtime" consumer
//! and control-side producers.

use sonance::config::QueueConfig;
use sonance::memory::{MemBlock, MemChunk};
use sonance::sync::{AsyncMsgQ, MESSAGE_SHUTDOWN, MsgObject};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Message target recording what it saw.
#[derive(Default)]
struct Sink {
    received: AtomicUsize,
    last_code: AtomicI32,
}

impl MsgObject for Sink {
    fn process_msg(
        &self,
        code: i32,
        userdata: Option<&mut (dyn Any + Send)>,
        chunk: Option<&MemChunk>,
    ) -> i32 {
        self.received.fetch_add(1, Ordering::SeqCst);
        self.last_code.store(code, Ordering::SeqCst);

        if let Some(counter) = userdata.and_then(|u| u.downcast_mut::<u64>()) {
            *counter += 1;
        }
        chunk.map_or(code, |c| c.length() as i32)
    }
}

/// Userdata whose destructor counts as the free callback.
struct Freed(Arc<AtomicUsize>);

impl Drop for Freed {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn as_object(sink: &Arc<Sink>) -> Arc<dyn MsgObject> {
    Arc::clone(sink) as Arc<dyn MsgObject>
}

// ============================================================================
// Ordering and exactly-once delivery
// ============================================================================

#[test]
fn test_thousand_posts_arrive_in_order_and_release_everything() {
    const N: i32 = 1000;

    let q = Arc::new(AsyncMsgQ::with_config(QueueConfig::with_capacity(16).with_name("e2e")).unwrap());
    let sink = Arc::new(Sink::default());
    let object = as_object(&sink);
    let block = Arc::new(MemBlock::from_bytes(&[1u8; 64]).unwrap());
    let freed = Arc::new(AtomicUsize::new(0));

    let producer = {
        let q = Arc::clone(&q);
        let object = Arc::clone(&object);
        let block = Arc::clone(&block);
        let freed = Arc::clone(&freed);
        thread::spawn(move || {
            for code in 0..N {
                let chunk = MemChunk::new(Arc::clone(&block), 0, (code % 64) as usize);
                q.post(
                    Some(&object),
                    code,
                    Some(Box::new(Freed(Arc::clone(&freed)))),
                    Some(&chunk),
                );
            }
        })
    };

    for expected in 0..N {
        let delivery = q.get(true).unwrap();
        assert_eq!(delivery.code(), expected);
        assert_eq!(delivery.chunk().unwrap().length(), (expected % 64) as usize);
        delivery.dispatch();
    }
    producer.join().unwrap();

    assert!(q.get(false).is_none());
    assert_eq!(sink.received.load(Ordering::SeqCst), N as usize);
    assert_eq!(freed.load(Ordering::SeqCst), N as usize);
    // Only our local handles remain
    assert_eq!(Arc::strong_count(&object), 2);
    assert_eq!(Arc::strong_count(&block), 1);
}

#[test]
fn test_thousand_payloads_without_chunks() {
    let q = Arc::new(AsyncMsgQ::new(32).unwrap());

    let producer = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            for payload in 0..1000u32 {
                q.post(None, 0, Some(Box::new(payload)), None);
            }
        })
    };

    for expected in 0..1000u32 {
        let delivery = q.get(true).unwrap();
        assert!(delivery.chunk().is_none());
        assert_eq!(delivery.userdata_ref::<u32>(), Some(&expected));
        delivery.done(0);
    }
    producer.join().unwrap();

    assert!(q.get(false).is_none());
}

#[test]
fn test_per_producer_order_with_many_producers() {
    const PRODUCERS: i32 = 4;
    const PER_PRODUCER: i32 = 500;

    let q = Arc::new(AsyncMsgQ::new(8).unwrap());
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    q.post(None, p * PER_PRODUCER + seq, None, None);
                }
            })
        })
        .collect();

    let mut last = vec![-1; PRODUCERS as usize];
    for _ in 0..PRODUCERS * PER_PRODUCER {
        let delivery = q.get(true).unwrap();
        let code = delivery.code();
        delivery.done(0);

        let producer = (code / PER_PRODUCER) as usize;
        let seq = code % PER_PRODUCER;
        assert!(seq > last[producer], "producer {producer} reordered");
        last[producer] = seq;
    }

    for p in producers {
        p.join().unwrap();
    }
    assert!(last.iter().all(|&s| s == PER_PRODUCER - 1));
}

// ============================================================================
// Blocking send
// ============================================================================

#[test]
fn test_send_blocks_until_done() {
    let q = Arc::new(AsyncMsgQ::new(8).unwrap());
    let returned = Arc::new(AtomicBool::new(false));

    let sender = {
        let q = Arc::clone(&q);
        let returned = Arc::clone(&returned);
        thread::spawn(move || {
            let result = q.send(None, 5, None, None);
            returned.store(true, Ordering::SeqCst);
            result
        })
    };

    let delivery = q.get(true).unwrap();
    assert!(delivery.is_send());
    assert_eq!(delivery.code(), 5);

    thread::sleep(Duration::from_millis(50));
    assert!(!returned.load(Ordering::SeqCst), "send returned before done");

    delivery.done(42);
    assert_eq!(sender.join().unwrap(), 42);
}

#[test]
fn test_send_returns_modified_userdata() {
    let q = Arc::new(AsyncMsgQ::new(8).unwrap());
    let sink = Arc::new(Sink::default());
    let object = as_object(&sink);

    let sender = {
        let q = Arc::clone(&q);
        let object = Arc::clone(&object);
        thread::spawn(move || q.send_returning(Some(&object), 9, Some(Box::new(41u64)), None))
    };

    assert_eq!(q.get(true).unwrap().dispatch(), 9);

    let (result, userdata) = sender.join().unwrap();
    assert_eq!(result, 9);
    assert_eq!(userdata.and_then(|u| u.downcast::<u64>().ok()).map(|b| *b), Some(42));
    assert_eq!(Arc::strong_count(&object), 2);
}

#[test]
fn test_send_behind_posts() {
    let q = Arc::new(AsyncMsgQ::new(16).unwrap());
    for code in 0..3 {
        q.post(None, code, None, None);
    }

    let sender = {
        let q = Arc::clone(&q);
        thread::spawn(move || q.send(None, 100, None, None))
    };

    let mut seen = Vec::new();
    for _ in 0..4 {
        let d = q.get(true).unwrap();
        let code = d.code();
        seen.push(code);
        d.done(code + 1);
    }
    assert_eq!(seen, vec![0, 1, 2, 100]);
    assert_eq!(sender.join().unwrap(), 101);
}

// ============================================================================
// Shutdown handshake and event-loop integration
// ============================================================================

#[test]
fn test_wait_for_discards_until_match() {
    let q = Arc::new(AsyncMsgQ::new(16).unwrap());
    let freed = Arc::new(AtomicUsize::new(0));

    for code in 1..=5 {
        q.post(None, code, Some(Box::new(Freed(Arc::clone(&freed)))), None);
    }
    q.post(None, MESSAGE_SHUTDOWN, None, None);
    q.post(None, 99, None, None);

    q.wait_for(MESSAGE_SHUTDOWN);

    assert_eq!(freed.load(Ordering::SeqCst), 5);
    let rest = q.get(false).unwrap();
    assert_eq!(rest.code(), 99);
    rest.done(0);
}

#[test]
fn test_poll_driven_consumer() {
    use rustix::event::{PollFd, PollFlags, poll};

    let q = Arc::new(AsyncMsgQ::new(4).unwrap());
    let sink = Arc::new(Sink::default());
    let object = as_object(&sink);

    let producer = {
        let q = Arc::clone(&q);
        let object = Arc::clone(&object);
        thread::spawn(move || {
            for code in 0..100 {
                q.post(Some(&object), code, None, None);
                if code % 10 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            q.post(None, MESSAGE_SHUTDOWN, None, None);
        })
    };

    // rtpoll-style loop: arm, sleep, disarm, drain
    'outer: loop {
        if q.before_poll() {
            let mut fds = [PollFd::from_borrowed_fd(q.get_fd(), PollFlags::IN)];
            poll(&mut fds, None).unwrap();
            q.after_poll();
        }

        while let Some(delivery) = q.get(false) {
            if delivery.object().is_none() && delivery.code() == MESSAGE_SHUTDOWN {
                delivery.done(0);
                break 'outer;
            }
            delivery.dispatch();
        }
    }

    producer.join().unwrap();
    assert_eq!(sink.received.load(Ordering::SeqCst), 100);
    assert_eq!(sink.last_code.load(Ordering::SeqCst), 99);
}

#[tokio::test]
async fn test_tokio_readable_consumer() {
    let q = Arc::new(AsyncMsgQ::new(8).unwrap());
    let sink = Arc::new(Sink::default());
    let object = as_object(&sink);

    let producer = {
        let q = Arc::clone(&q);
        let object = Arc::clone(&object);
        thread::spawn(move || {
            for code in 0..20 {
                thread::sleep(Duration::from_millis(1));
                q.post(Some(&object), code, None, None);
            }
        })
    };

    let mut processed = 0;
    while processed < 20 {
        tokio::time::timeout(Duration::from_secs(5), q.readable())
            .await
            .expect("queue became readable")
            .unwrap();
        processed += q.process_pending();
    }

    producer.join().unwrap();
    assert_eq!(sink.received.load(Ordering::SeqCst), 20);
}

#[test]
fn test_drop_with_pending_messages_releases_references() {
    let sink = Arc::new(Sink::default());
    let object = as_object(&sink);
    let block = Arc::new(MemBlock::from_bytes(b"tail").unwrap());
    let freed = Arc::new(AtomicUsize::new(0));

    {
        let q = AsyncMsgQ::new(8).unwrap();
        for code in 0..5 {
            q.post(
                Some(&object),
                code,
                Some(Box::new(Freed(Arc::clone(&freed)))),
                Some(&MemChunk::whole(Arc::clone(&block))),
            );
        }
        assert_eq!(Arc::strong_count(&object), 7);
    }

    assert_eq!(Arc::strong_count(&object), 2);
    assert_eq!(Arc::strong_count(&block), 1);
    assert_eq!(freed.load(Ordering::SeqCst), 5);
    assert_eq!(sink.received.load(Ordering::SeqCst), 0);
}
