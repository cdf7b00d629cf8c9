//! Two cooperating worker pools behind one dispatcher.
//!
//! The priority pool carries CPU-bound validation, sized to
//! `min(configured, cores)`; the general pool carries subscriber fan-out
//! and other handler work so validation threads never run user callbacks.

use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use crate::error::Error;
use crate::settings::Settings;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

const GENERAL_THREADS: usize = 2;

pub struct WorkerPool {
    sender: Sender<Message>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self, Error> {
        let (sender, receiver) = unbounded::<Message>();
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    while let Ok(Message::Run(job)) = receiver.recv() {
                        job();
                    }
                })
                .map_err(|_| Error::OperationFailed)?;
            handles.push(handle);
        }
        Ok(Self {
            sender,
            handles: Mutex::new(handles),
        })
    }

    /// Queue a job; returns false once the pool has been closed.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.sender.send(Message::Run(Box::new(job))).is_ok()
    }

    /// Drain queued work and join every thread. Idempotent.
    pub fn close(&self) {
        let handles = {
            let Ok(mut guard) = self.handles.lock() else {
                return;
            };
            std::mem::take(&mut *guard)
        };
        for _ in 0..handles.len() {
            let _ = self.sender.send(Message::Stop);
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

pub struct Dispatcher {
    priority: rayon::ThreadPool,
    general: WorkerPool,
}

impl Dispatcher {
    pub fn new(settings: &Settings) -> Result<Self, Error> {
        let prefix = if settings.priority {
            "keeld-priority"
        } else {
            "keeld-validate"
        };
        let priority = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.priority_threads())
            .thread_name(move |index| format!("{prefix}-{index}"))
            .build()
            .map_err(|_| Error::OperationFailed)?;
        Ok(Self {
            priority,
            general: WorkerPool::new("keeld-general", GENERAL_THREADS)?,
        })
    }

    pub fn spawn_priority(&self, job: impl FnOnce() + Send + 'static) {
        self.priority.spawn(job);
    }

    pub fn spawn_general(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.general.spawn(job)
    }

    /// Join-style fan-out: spawn tasks into the priority pool and return
    /// when the last completes. Tasks may borrow from the caller's frame.
    pub fn priority_scope<'scope, OP>(&self, op: OP)
    where
        OP: FnOnce(&rayon::Scope<'scope>) + Send,
    {
        self.priority.scope(op);
    }

    /// Join the general pool. The priority pool drains when dropped.
    pub fn close(&self) {
        self.general.close();
    }
}
