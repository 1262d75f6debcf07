//! # Frame Queue - Producer/Worker Hand-off
//!
//! Decouples the render callback from conversion and transport I/O:
//!
//! ```text
//! ┌──────────┐ push ┌────────────┐ pop ┌──────────────┐    ┌───────────┐
//! │ Producer │─────►│ FrameQueue │────►│ Worker       │───►│ Transport │
//! │ (render) │      │ (bounded)  │     │ (dispatcher) │    │           │
//! └──────────┘      └────────────┘     └──────────────┘    └───────────┘
//! ```
//!
//! - Strict FIFO; sequence numbers are assigned under the queue lock
//! - Bounded, with a drop-oldest or block-producer overflow policy
//! - `stop()` wakes everyone, joins the worker and discards what is left

use crate::config::OverflowPolicy;
use crate::frame::{FrameDescriptor, QueueEntry, RawFrame};
use crate::metadata::ColorimetryDescriptor;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// ============================================================================
// Queue Configuration
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Maximum frames waiting for the worker
    pub capacity: usize,
    pub policy: OverflowPolicy,
    /// How long a blocked producer waits for space
    pub block_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 8, // ~250ms at 30fps
            policy: OverflowPolicy::DropOldest,
            block_timeout: Duration::from_millis(100),
        }
    }
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued with this sequence number
    Queued(u64),
    /// Queued, and the oldest entry was evicted to make room
    QueuedEvicting { sequence: u64, evicted: u64 },
    /// Not queued: full past the timeout, or stopped
    Rejected,
}

impl PushOutcome {
    pub fn is_queued(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

// ============================================================================
// Frame Queue
// ============================================================================

pub struct FrameQueue {
    config: QueueConfig,

    entries: Mutex<VecDeque<QueueEntry>>,

    /// Signalled when an entry arrives or on stop
    ready_cond: Condvar,

    /// Signalled when an entry leaves or on stop
    space_cond: Condvar,

    stopped: AtomicBool,

    /// Next sequence number, only advanced under the entries lock
    next_sequence: AtomicU64,

    frames_pushed: AtomicU64,
    frames_popped: AtomicU64,
    frames_dropped: AtomicU64,
    frames_discarded: AtomicU64,
}

impl FrameQueue {
    pub fn new(config: QueueConfig) -> Self {
        let config = QueueConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            config,
            entries: Mutex::new(VecDeque::with_capacity(config.capacity)),
            ready_cond: Condvar::new(),
            space_cond: Condvar::new(),
            stopped: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
            frames_pushed: AtomicU64::new(0),
            frames_popped: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_discarded: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Producer API
    // ========================================================================

    /// Push a frame, applying the overflow policy when full
    pub fn push(
        &self,
        frame: RawFrame,
        descriptor: FrameDescriptor,
        colorimetry: ColorimetryDescriptor,
    ) -> PushOutcome {
        let mut entries = self.entries.lock();
        let mut evicted = None;

        if entries.len() >= self.config.capacity && !self.is_stopped() {
            match self.config.policy {
                OverflowPolicy::DropOldest => {
                    if let Some(old) = entries.pop_front() {
                        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Queue full, dropped oldest frame #{}", old.sequence);
                        evicted = Some(old.sequence);
                    }
                }
                OverflowPolicy::BlockProducer => {
                    let deadline = Instant::now() + self.config.block_timeout;
                    while entries.len() >= self.config.capacity && !self.is_stopped() {
                        if self.space_cond.wait_until(&mut entries, deadline).timed_out() {
                            break;
                        }
                    }
                    if entries.len() >= self.config.capacity && !self.is_stopped() {
                        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Queue full after {:?}, dropped new frame", self.config.block_timeout);
                        return PushOutcome::Rejected;
                    }
                }
            }
        }

        if self.is_stopped() {
            return PushOutcome::Rejected;
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        entries.push_back(QueueEntry::new(frame, descriptor, colorimetry, sequence));
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
        self.ready_cond.notify_one();

        match evicted {
            Some(evicted) => PushOutcome::QueuedEvicting { sequence, evicted },
            None => PushOutcome::Queued(sequence),
        }
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Wait for the next entry. `None` once stopped.
    pub fn pop_blocking(&self) -> Option<QueueEntry> {
        let mut entries = self.entries.lock();
        loop {
            if self.is_stopped() {
                return None;
            }
            if let Some(entry) = entries.pop_front() {
                self.frames_popped.fetch_add(1, Ordering::Relaxed);
                self.space_cond.notify_one();
                return Some(entry);
            }
            self.ready_cond.wait(&mut entries);
        }
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<QueueEntry> {
        let mut entries = self.entries.lock();
        let entry = entries.pop_front()?;
        self.frames_popped.fetch_add(1, Ordering::Relaxed);
        self.space_cond.notify_one();
        Some(entry)
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Refuse further pushes and wake every waiter
    pub fn close(&self) {
        // Store under the lock so no waiter misses the wake-up
        let _entries = self.entries.lock();
        self.stopped.store(true, Ordering::SeqCst);
        self.ready_cond.notify_all();
        self.space_cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Drop everything still queued, returning how many were dropped
    pub fn discard_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        self.frames_discarded.fetch_add(count as u64, Ordering::Relaxed);
        self.space_cond.notify_all();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.len(),
            capacity: self.config.capacity,
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_popped: self.frames_popped.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub frames_pushed: u64,
    pub frames_popped: u64,
    /// Lost to the overflow policy
    pub frames_dropped: u64,
    /// Thrown away at stop
    pub frames_discarded: u64,
}

// ============================================================================
// Async Submitter
// ============================================================================

/// Owns the queue and the single worker thread that drains it
pub struct AsyncSubmitter {
    queue: Arc<FrameQueue>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncSubmitter {
    /// Spawn the worker. `handler` runs on the worker thread for every
    /// entry, in queue order.
    pub fn start<F>(config: QueueConfig, mut handler: F) -> std::io::Result<Self>
    where
        F: FnMut(QueueEntry) + Send + 'static,
    {
        let queue = Arc::new(FrameQueue::new(config));
        let worker_queue = queue.clone();

        let worker = std::thread::Builder::new()
            .name("framecast-sender".into())
            .spawn(move || {
                tracing::debug!("Send worker started");
                while let Some(entry) = worker_queue.pop_blocking() {
                    let latency = entry.enqueued_at.elapsed();
                    tracing::trace!("Frame #{} dequeued after {:?}", entry.sequence, latency);
                    handler(entry);
                }
                tracing::debug!("Send worker exiting");
            })?;

        tracing::info!(
            "Async submitter started (capacity {}, {:?})",
            queue.capacity(),
            config.policy
        );

        Ok(Self {
            queue,
            worker: Some(worker),
        })
    }

    /// Hand a frame to the worker; returns without waiting for conversion
    pub fn submit(
        &self,
        frame: RawFrame,
        descriptor: FrameDescriptor,
        colorimetry: ColorimetryDescriptor,
    ) -> PushOutcome {
        self.queue.push(frame, descriptor, colorimetry)
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stop the worker and discard queued frames. The frame being converted
    /// when this is called still finishes. Returns the number discarded.
    pub fn stop(&mut self) -> usize {
        let Some(worker) = self.worker.take() else {
            return 0;
        };

        self.queue.close();
        if worker.join().is_err() {
            tracing::error!("Send worker panicked");
        }

        let discarded = self.queue.discard_all();
        if discarded > 0 {
            tracing::warn!("Async submitter stopped, {} queued frames discarded", discarded);
        } else {
            tracing::info!("Async submitter stopped");
        }
        discarded
    }
}

impl Drop for AsyncSubmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================
