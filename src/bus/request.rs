use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::symbol::{SymbolString, TelegramKind};

/// Scheduling class of a request. Writes preempt reads; polls are only
/// taken when the queue is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Write,
    Read,
    Poll,
}

#[derive(Debug)]
struct Slot {
    result: Mutex<Option<Result<SymbolString>>>,
    ready: Condvar,
}

/// A transient unit of bus work: the telegram to send plus the completion
/// slot. Created by the dispatcher or the poller, enqueued, picked by the
/// bus thread, attempted with retries, completed exactly once.
#[derive(Debug)]
pub struct BusRequest {
    master: SymbolString,
    kind: TelegramKind,
    priority: Priority,
    canceled: Arc<AtomicBool>,
    slot: Arc<Slot>,
}

/// The submitter's side of a request: wait with a deadline, or cancel.
#[derive(Debug)]
pub struct RequestHandle {
    canceled: Arc<AtomicBool>,
    slot: Arc<Slot>,
}

impl BusRequest {
    pub fn new(master: SymbolString, priority: Priority) -> (BusRequest, RequestHandle) {
        let kind = TelegramKind::of(master.destination().unwrap_or(0));
        let canceled = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(Slot {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let handle = RequestHandle {
            canceled: canceled.clone(),
            slot: slot.clone(),
        };
        (
            BusRequest {
                master,
                kind,
                priority,
                canceled,
                slot,
            },
            handle,
        )
    }

    pub fn master(&self) -> &SymbolString {
        &self.master
    }

    pub fn kind(&self) -> TelegramKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Completes the request and wakes the submitter. Consumes the request
    /// so a result is set exactly once.
    pub fn complete(self, result: Result<SymbolString>) {
        let mut slot = self.slot.result.lock().unwrap();
        *slot = Some(result);
        self.slot.ready.notify_all();
    }
}

impl RequestHandle {
    /// Waits for completion. An elapsed deadline returns `DeviceTimeout`
    /// without canceling; the submitter decides whether to [`cancel`].
    ///
    /// [`cancel`]: RequestHandle::cancel
    pub fn wait(&self, timeout: Duration) -> Result<SymbolString> {
        let mut slot = self.slot.result.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while slot.is_none() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::DeviceTimeout);
            }
            let (guard, wait) = self.slot.ready.wait_timeout(slot, remaining).unwrap();
            slot = guard;
            if wait.timed_out() && slot.is_none() {
                return Err(Error::DeviceTimeout);
            }
        }
        slot.take().unwrap()
    }

    /// Marks the request canceled; the engine discards it when it reaches
    /// it in the queue. A request that already went active may still
    /// complete normally.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }
}

/// The bounded request queue between submitters and the bus thread.
/// FIFO within each priority class; canceled requests are completed with
/// `Canceled` when they surface.
#[derive(Debug)]
pub struct RequestQueue {
    inner: Mutex<Queues>,
    space: Condvar,
    capacity: usize,
}

#[derive(Debug, Default)]
struct Queues {
    writes: VecDeque<BusRequest>,
    reads: VecDeque<BusRequest>,
    polls: VecDeque<BusRequest>,
}

impl Queues {
    fn len(&self) -> usize {
        self.writes.len() + self.reads.len() + self.polls.len()
    }
}

impl RequestQueue {
    pub fn new(capacity: usize) -> RequestQueue {
        RequestQueue {
            inner: Mutex::new(Queues::default()),
            space: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues a request, blocking while the queue is full.
    pub fn push(&self, request: BusRequest) {
        let mut inner = self.inner.lock().unwrap();
        while inner.len() >= self.capacity {
            inner = self.space.wait(inner).unwrap();
        }
        match request.priority() {
            Priority::Write => inner.writes.push_back(request),
            Priority::Read => inner.reads.push_back(request),
            Priority::Poll => inner.polls.push_back(request),
        }
    }

    /// Takes the next request by priority class, discarding canceled ones.
    pub fn pop(&self) -> Option<BusRequest> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let next = inner
                .writes
                .pop_front()
                .or_else(|| inner.reads.pop_front())
                .or_else(|| inner.polls.pop_front());
            self.space.notify_one();
            match next {
                Some(request) if request.is_canceled() => {
                    request.complete(Err(Error::Canceled));
                }
                other => return other,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
