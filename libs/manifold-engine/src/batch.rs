//! Double-buffered append batch used by buffered producers.
//!
//! Writers append whole records to the active queue; a flusher swaps the
//! queues, waits for in-flight writers, and hands the retired bytes to the
//! sink's write callback. The writer count and byte offset of each queue
//! live in one atomic word, so appends never take a lock; only flushes
//! serialize on a mutex.

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Outcome of one append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Appended,
    /// The active queue has no room left; flush and retry.
    Full,
    /// The record exceeds the total queue capacity and can never fit.
    TooLarge,
}

/// Future returned by a flush write callback; resolves to `true` when the
/// sink accepted the bytes. The lifetime covers whatever the callback
/// borrows from its environment (file handles, clients).
pub type FlushFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

// Queue state word: low 32 bits byte offset, high 32 bits in-flight writers.
const OFFSET_MASK: u64 = 0xFFFF_FFFF;
const WRITER_ONE: u64 = 1 << 32;

const NO_RETIRED: usize = usize::MAX;

struct BatchQueue {
    state: AtomicU64,
    buf: Box<[UnsafeCell<u8>]>,
}

// Writers copy into disjoint reserved ranges through the cells; the
// flusher only reads a queue once its writer count is zero and new appends
// go to the other queue. See `MessageBatch::append` and `flush`.
unsafe impl Sync for BatchQueue {}

impl BatchQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: AtomicU64::new(0),
            buf: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    fn data_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> is layout-compatible with u8.
        self.buf.as_ptr() as *mut u8
    }

    fn used(&self) -> usize {
        (self.state.load(Ordering::Acquire) & OFFSET_MASK) as usize
    }

    fn writers(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> 32
    }
}

/// Byte-bounded double buffer with a retrying flush protocol.
pub struct MessageBatch {
    queues: [BatchQueue; 2],
    active: AtomicUsize,
    /// Queue index left over from a failed flush; `NO_RETIRED` when the
    /// previous flush succeeded. Only touched under `flush_lock`.
    retired: AtomicUsize,
    flush_lock: tokio::sync::Mutex<()>,
    last_flush: parking_lot::Mutex<Instant>,
    capacity: usize,
}

impl MessageBatch {
    /// `capacity` is the byte budget of each queue. Capped below 4 GiB so
    /// the offset fits its 32 state bits.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(OFFSET_MASK as usize);
        Self {
            queues: [BatchQueue::new(capacity), BatchQueue::new(capacity)],
            active: AtomicUsize::new(0),
            retired: AtomicUsize::new(NO_RETIRED),
            flush_lock: tokio::sync::Mutex::new(()),
            last_flush: parking_lot::Mutex::new(Instant::now()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one whole record. Never blocks and never splits a record:
    /// either the full record lands in the active queue or nothing does.
    pub fn append(&self, data: &[u8]) -> AppendResult {
        let len = data.len() as u64;
        if data.len() > self.capacity {
            return AppendResult::TooLarge;
        }
        if data.is_empty() {
            return AppendResult::Appended;
        }

        loop {
            let active = self.active.load(Ordering::Acquire);
            let queue = &self.queues[active];

            let state = queue.state.load(Ordering::Acquire);
            let used = state & OFFSET_MASK;
            if used + len > self.capacity as u64 {
                return AppendResult::Full;
            }

            // Reserve [used, used + len) and announce ourselves as a
            // writer in one step. A concurrent flush reset or competing
            // append changes the word and fails the exchange.
            if queue
                .state
                .compare_exchange_weak(
                    state,
                    state + WRITER_ONE + len,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            let start = used as usize;
            unsafe {
                // The range was reserved exclusively above, and the
                // flusher waits for the writer count to drop before
                // reading. Raw copy so concurrent writers never form
                // aliasing references.
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    queue.data_ptr().add(start),
                    data.len(),
                );
            }
            queue.state.fetch_sub(WRITER_ONE, Ordering::AcqRel);
            return AppendResult::Appended;
        }
    }

    /// Bytes currently pending in the active queue.
    pub fn pending_bytes(&self) -> usize {
        self.queues[self.active.load(Ordering::Acquire)].used()
    }

    pub fn is_empty(&self) -> bool {
        self.queues[0].used() == 0 && self.queues[1].used() == 0
    }

    pub fn reached_size_threshold(&self, bytes: usize) -> bool {
        self.pending_bytes() >= bytes
    }

    pub fn reached_time_threshold(&self, interval: Duration) -> bool {
        self.last_flush.lock().elapsed() >= interval
    }

    /// Flush the retired queue through `write`.
    ///
    /// Exactly one flush runs at a time. A failed write keeps the retired
    /// queue intact and the next flush retries the same bytes before
    /// swapping again. Returns `false` when the callback reported failure.
    pub async fn flush<'a, F>(&self, write: F) -> bool
    where
        F: FnOnce(Vec<u8>) -> FlushFuture<'a>,
    {
        let _guard = self.flush_lock.lock().await;

        // Retry a previously failed queue before retiring the active one.
        let retired_idx = match self.retired.load(Ordering::Acquire) {
            NO_RETIRED => {
                let active = self.active.load(Ordering::Acquire);
                self.active.store(1 - active, Ordering::Release);
                active
            }
            idx => idx,
        };

        let queue = &self.queues[retired_idx];

        // Writers that reserved before the swap may still be copying.
        while queue.writers() != 0 {
            tokio::task::yield_now().await;
        }

        let used = queue.used();
        if used == 0 {
            self.retired.store(NO_RETIRED, Ordering::Release);
            *self.last_flush.lock() = Instant::now();
            return true;
        }

        // No writers remain and appends target the other queue.
        let data = unsafe { std::slice::from_raw_parts(queue.data_ptr(), used) }.to_vec();

        if write(data).await {
            queue.state.store(0, Ordering::Release);
            self.retired.store(NO_RETIRED, Ordering::Release);
            *self.last_flush.lock() = Instant::now();
            true
        } else {
            self.retired.store(retired_idx, Ordering::Release);
            false
        }
    }

    /// Block until any in-flight flush returns. Used at shutdown.
    pub async fn wait_for_flush(&self) {
        drop(self.flush_lock.lock().await);
    }
}

impl std::fmt::Debug for MessageBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBatch")
            .field("capacity", &self.capacity)
            .field("pending_bytes", &self.pending_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn accept(collected: Arc<parking_lot::Mutex<Vec<u8>>>) -> impl FnOnce(Vec<u8>) -> FlushFuture<'static> {
        move |data| {
            Box::pin(async move {
                collected.lock().extend_from_slice(&data);
                true
            })
        }
    }

    #[tokio::test]
    async fn append_then_flush_preserves_order() {
        let batch = MessageBatch::new(1024);
        assert_eq!(batch.append(b"one"), AppendResult::Appended);
        assert_eq!(batch.append(b"two"), AppendResult::Appended);

        let out = Arc::new(parking_lot::Mutex::new(Vec::new()));
        assert!(batch.flush(accept(out.clone())).await);
        assert_eq!(out.lock().as_slice(), b"onetwo");
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn full_queue_rejects_without_corruption() {
        let batch = MessageBatch::new(8);
        assert_eq!(batch.append(b"12345"), AppendResult::Appended);
        assert_eq!(batch.append(b"6789"), AppendResult::Full);
        assert_eq!(batch.pending_bytes(), 5);

        let out = Arc::new(parking_lot::Mutex::new(Vec::new()));
        assert!(batch.flush(accept(out.clone())).await);
        assert_eq!(out.lock().as_slice(), b"12345");
    }

    #[tokio::test]
    async fn oversized_record_is_rejected_outright() {
        let batch = MessageBatch::new(4);
        assert_eq!(batch.append(b"too large"), AppendResult::TooLarge);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn failed_flush_retries_same_bytes() {
        let batch = MessageBatch::new(64);
        batch.append(b"payload");

        let fail_once = Arc::new(AtomicBool::new(true));
        let failed = batch
            .flush(|data| {
                assert_eq!(data, b"payload");
                let fail_once = fail_once.clone();
                Box::pin(async move { !fail_once.swap(false, Ordering::SeqCst) })
            })
            .await;
        assert!(!failed);
        assert!(!batch.is_empty());

        // New appends go to the other queue while the retry is pending.
        batch.append(b"next");

        let out = Arc::new(parking_lot::Mutex::new(Vec::new()));
        assert!(batch.flush(accept(out.clone())).await);
        assert_eq!(out.lock().as_slice(), b"payload");

        let out2 = Arc::new(parking_lot::Mutex::new(Vec::new()));
        assert!(batch.flush(accept(out2.clone())).await);
        assert_eq!(out2.lock().as_slice(), b"next");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_records_whole() {
        let batch = Arc::new(MessageBatch::new(1 << 20));
        let mut tasks = Vec::new();
        for worker in 0u8..4 {
            let batch = batch.clone();
            tasks.push(tokio::spawn(async move {
                let record = [worker; 37];
                for _ in 0..200 {
                    while batch.append(&record) != AppendResult::Appended {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let out = Arc::new(parking_lot::Mutex::new(Vec::new()));
        assert!(batch.flush(accept(out.clone())).await);
        assert!(batch.flush(accept(out.clone())).await);

        let data = out.lock();
        assert_eq!(data.len(), 4 * 200 * 37);
        // Whole records only: every 37-byte window holds one worker id.
        for record in data.chunks(37) {
            assert!(record.iter().all(|b| *b == record[0]));
        }
    }

    #[tokio::test]
    async fn time_threshold_uses_last_flush() {
        let batch = MessageBatch::new(16);
        assert!(!batch.reached_time_threshold(Duration::from_secs(60)));
        assert!(batch.reached_time_threshold(Duration::ZERO));
    }
}
