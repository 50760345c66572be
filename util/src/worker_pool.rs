//! A fixed set of named background threads pulling boxed jobs off a shared queue. Used for work
//! that must never run on the thread driving the frame loop: chunk loading, generation, lighting,
//! meshing and saving.

use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use crossbeam::{atomic::AtomicCell, channel};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolSettings {
    pub worker_count: usize,
    /// How long a worker waits on an empty queue before re-checking the killed flag.
    pub job_receive_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            job_receive_timeout: Duration::from_millis(5),
            terminate_timeout: Duration::from_secs(2),
        }
    }
}

pub struct WorkerPool {
    name: String,
    job_sender: Option<channel::Sender<Job>>,
    exit_receiver: channel::Receiver<()>,
    join_handles: Vec<JoinHandle<()>>,
    killed: Arc<AtomicCell<bool>>,
    count_failed: Arc<AtomicCell<usize>>,
    settings: PoolSettings,
}

struct Worker {
    job_receiver: channel::Receiver<Job>,
    killed: Arc<AtomicCell<bool>>,
    count_failed: Arc<AtomicCell<usize>>,
    settings: PoolSettings,
    // Dropped when the worker exits. Once every worker has exited the pool's exit receiver
    // disconnects.
    _exit_sender: channel::Sender<()>,
}

impl WorkerPool {
    pub fn new(name: &str, settings: PoolSettings) -> Result<Self> {
        if settings.worker_count == 0 {
            bail!("worker pool {} needs at least one worker", name);
        }

        let killed = Arc::new(AtomicCell::new(false));
        let count_failed = Arc::new(AtomicCell::new(0));
        let (job_sender, job_receiver) = channel::unbounded::<Job>();
        let (exit_sender, exit_receiver) = channel::bounded(0);

        let mut join_handles = Vec::with_capacity(settings.worker_count);
        for index in 0..settings.worker_count {
            let mut worker = Worker {
                job_receiver: job_receiver.clone(),
                killed: killed.clone(),
                count_failed: count_failed.clone(),
                settings: settings.clone(),
                _exit_sender: exit_sender.clone(),
            };

            let join_handle = std::thread::Builder::new()
                .name(format!("{}_{}", name, index))
                .spawn(move || worker.run())?;
            join_handles.push(join_handle);
        }

        log::info!(
            "Started worker pool {} with {} threads",
            name,
            settings.worker_count
        );

        Ok(Self {
            name: name.into(),
            job_sender: Some(job_sender),
            exit_receiver,
            join_handles,
            killed,
            count_failed,
            settings,
        })
    }

    /// Queues a job. Never blocks: the queue is unbounded.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let sender = self
            .job_sender
            .as_ref()
            .ok_or_else(|| anyhow!("submitting job to finished worker pool {}", self.name))?;

        sender
            .send(Box::new(job))
            .map_err(|_| anyhow!("all workers in pool {} have exited", self.name))
    }

    pub fn count_failed(&self) -> usize {
        self.count_failed.load()
    }

    /// Stops the pool. Jobs already running finish; jobs still queued are discarded. Returns an
    /// error if the workers do not all exit within the terminate timeout.
    pub fn finish(&mut self) -> Result<()> {
        if self.job_sender.is_none() && self.join_handles.is_empty() {
            return Ok(());
        }

        self.killed.store(true);
        self.job_sender = None;

        let begin_time = Instant::now();
        let clean_exit = loop {
            let elapsed = begin_time.elapsed();
            if elapsed > self.settings.terminate_timeout {
                break false;
            }

            match self
                .exit_receiver
                .recv_timeout(self.settings.terminate_timeout - elapsed)
            {
                Ok(()) => {}
                Err(channel::RecvTimeoutError::Disconnected) => break true,
                Err(channel::RecvTimeoutError::Timeout) => break false,
            }
        };

        log::info!(
            "Worker pool {} stopped. Clean exit: {}. Failed jobs: {}.",
            self.name,
            clean_exit,
            self.count_failed.load()
        );

        if !clean_exit {
            return Err(anyhow!(
                "Workers in pool {} did not finish within {:?}",
                self.name,
                self.settings.terminate_timeout
            ));
        }

        let mut panicked = 0;
        for join_handle in self.join_handles.drain(..) {
            if join_handle.join().is_err() {
                panicked += 1;
            }
        }

        if panicked > 0 {
            bail!("{} workers in pool {} panicked", panicked, self.name);
        }

        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        match self.finish() {
            Ok(()) => {}
            Err(end_error) => {
                for error in end_error.chain() {
                    log::error!("{}", error);
                    log::error!("========");
                }
            }
        }
    }
}

impl Worker {
    fn run(&mut self) {
        loop {
            if self.killed.load() {
                break;
            }

            match self
                .job_receiver
                .recv_timeout(self.settings.job_receive_timeout)
            {
                Ok(job) => {
                    if let Err(end_error) = job() {
                        self.count_failed.fetch_add(1);
                        for error in end_error.chain() {
                            log::error!("{}", error);
                        }
                    }
                }
                Err(channel::RecvTimeoutError::Timeout) => {}
                Err(channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

/// Counts outstanding tasks of one kind so that a caller can wait for all of them to finish.
/// Each task holds a `TaskToken` for its lifetime.
#[derive(Clone, Default)]
pub struct TaskGroup {
    inner: Arc<TaskGroupInner>,
}

#[derive(Default)]
struct TaskGroupInner {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

pub struct TaskToken {
    inner: Arc<TaskGroupInner>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> TaskToken {
        *self.inner.outstanding.lock() += 1;
        TaskToken {
            inner: self.inner.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.lock()
    }

    /// Blocks until no tokens are outstanding. Returns false if the timeout elapsed first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.inner.outstanding.lock();
        while *outstanding > 0 {
            if self
                .inner
                .idle
                .wait_until(&mut outstanding, deadline)
                .timed_out()
            {
                return *outstanding == 0;
            }
        }
        true
    }
}

impl Drop for TaskToken {
    fn drop(&mut self) {
        let mut outstanding = self.inner.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.inner.idle.notify_all();
        }
    }
}
