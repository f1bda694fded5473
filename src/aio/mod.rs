//! # Asynchronous I/O
//!
//! A small worker pool that executes reads and writes against shared
//! array handles off the caller's thread. Requests are plain values: the
//! caller hands over buffers and an optional completion callback, the pool
//! fills in sizes and a final status, and the callback fires exactly once.
//!
//! The library spins up no threads on its own behalf elsewhere; this pool
//! is the only place worker threads exist, and it is owned by the
//! `StorageManager` that created it.
//!
//! ## Cancellation
//!
//! A request can be canceled only while it still sits in the queue; once a
//! worker dequeues it, it runs to completion. A canceled request's
//! completion fires with [`AioStatus::Canceled`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::array::{Array, ReadStatus};
use crate::config::AIO_THREAD_COUNT;

/// Final state of an asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioStatus {
    InProgress,
    Completed,
    /// A read filled at least one buffer; resubmit to resume.
    Overflow,
    Error,
    Canceled,
}

/// Direction of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioMode {
    Read,
    Write,
}

pub type Completion = Box<dyn FnOnce(&AioRequest) + Send>;

/// One asynchronous read or write. Buffers follow the same layout as the
/// synchronous `Array::read`/`Array::write` calls.
pub struct AioRequest {
    /// Assigned at submit time.
    pub id: u64,
    pub mode: AioMode,
    /// Read only: subarray to apply before reading.
    pub subarray: Option<Vec<i64>>,
    pub buffers: Vec<Vec<u8>>,
    /// Read only: bytes produced per buffer.
    pub sizes: Vec<usize>,
    pub status: AioStatus,
    /// Invoked exactly once, after the request reaches a final status.
    pub completion: Option<Completion>,
    /// Error text when `status == Error`.
    pub error: Option<String>,
}

impl AioRequest {
    pub fn read(buffers: Vec<Vec<u8>>, subarray: Option<Vec<i64>>) -> Self {
        let buffer_count = buffers.len();
        Self {
            id: 0,
            mode: AioMode::Read,
            subarray,
            buffers,
            sizes: vec![0; buffer_count],
            status: AioStatus::InProgress,
            completion: None,
            error: None,
        }
    }

    pub fn write(buffers: Vec<Vec<u8>>) -> Self {
        Self {
            id: 0,
            mode: AioMode::Write,
            subarray: None,
            buffers,
            sizes: Vec::new(),
            status: AioStatus::InProgress,
            completion: None,
            error: None,
        }
    }

    pub fn on_complete(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }
}

struct Job {
    array: Arc<Mutex<Array>>,
    request: AioRequest,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    ready: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size worker pool; see the module docs.
pub struct AioPool {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    workers: Vec<JoinHandle<()>>,
}

impl AioPool {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..AIO_THREAD_COUNT)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("gridstore-aio-{}", worker))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn AIO worker")
            })
            .collect();
        Self {
            shared,
            next_id: AtomicU64::new(1),
            workers,
        }
    }

    /// Queues a request against a shared handle and returns its id.
    pub fn submit(&self, array: Arc<Mutex<Array>>, mut request: AioRequest) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;
        request.status = AioStatus::InProgress;
        {
            let mut queue = self.shared.queue.lock();
            queue.push_back(Job { array, request });
        }
        self.shared.ready.notify_one();
        id
    }

    /// Cancels a queued request. Returns `false` when the request already
    /// started (or finished); running requests are never interrupted.
    pub fn cancel(&self, id: u64) -> bool {
        let job = {
            let mut queue = self.shared.queue.lock();
            queue
                .iter()
                .position(|job| job.request.id == id)
                .and_then(|at| queue.remove(at))
        };
        match job {
            Some(mut job) => {
                job.request.status = AioStatus::Canceled;
                finish(job.request);
                true
            }
            None => false,
        }
    }

    /// Number of requests still waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Default for AioPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AioPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // Anything still queued is canceled, keeping the exactly-once
        // completion contract.
        let mut queue = self.shared.queue.lock();
        while let Some(mut job) = queue.pop_front() {
            job.request.status = AioStatus::Canceled;
            finish(job.request);
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                shared.ready.wait(&mut queue);
            }
        };
        execute(job);
    }
}

fn execute(job: Job) {
    let Job { array, mut request } = job;
    let outcome = run(&array, &mut request);
    // Release the shared handle before the completion fires, so a caller
    // woken by its completion can immediately reclaim sole ownership.
    drop(array);
    request.status = match outcome {
        Ok(status) => status,
        Err(report) => {
            debug!("aio request {} failed: {:#}", request.id, report);
            request.error = Some(format!("{:#}", report));
            AioStatus::Error
        }
    };
    finish(request);
}

fn run(array: &Mutex<Array>, request: &mut AioRequest) -> eyre::Result<AioStatus> {
    let mut array = array.lock();
    match request.mode {
        AioMode::Read => {
            if let Some(subarray) = &request.subarray {
                array.reset_subarray(subarray)?;
            }
            let mut views: Vec<&mut [u8]> = request
                .buffers
                .iter_mut()
                .map(|b| b.as_mut_slice())
                .collect();
            match array.read(&mut views, &mut request.sizes)? {
                ReadStatus::Completed => Ok(AioStatus::Completed),
                ReadStatus::Incomplete => Ok(AioStatus::Overflow),
            }
        }
        AioMode::Write => {
            let views: Vec<&[u8]> = request.buffers.iter().map(|b| b.as_slice()).collect();
            array.write(&views)?;
            Ok(AioStatus::Completed)
        }
    }
}

fn finish(mut request: AioRequest) {
    if let Some(completion) = request.completion.take() {
        completion(&request);
    }
}
