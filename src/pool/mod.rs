//! Persistent worker pool with ordered completion handles.
//!
//! Each worker thread owns a private state value (a cipher handle, a
//! compression context) for its whole lifetime. Callers submit a batch of
//! tasks, then wait on the returned handles in submission order; that is the
//! only ordering guarantee the pool gives, and it is all the chunked codecs
//! need to keep their output in input order.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::{Error, Result};

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Completion handle of one submitted task.
pub struct TaskHandle<T> {
    rx: Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes and return its result.
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(res) => res,
            Err(_) => Err(Error::Worker("worker exited before completing its task".into()).into()),
        }
    }
}

pub struct WorkerPool<S: Send + 'static> {
    name: String,
    sender: Option<Sender<Job<S>>>,
    workers: Vec<JoinHandle<()>>,
}

impl<S: Send + 'static> WorkerPool<S> {
    /// Spawn `threads` workers; `init` builds each worker's private state.
    pub fn new<F>(name: &str, threads: usize, mut init: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<S>,
    {
        let threads = threads.max(1);
        let (sender, receiver) = bounded::<Job<S>>(threads);
        let mut workers = Vec::with_capacity(threads);

        for idx in 0..threads {
            let mut state = init(idx)?;
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || {
                    for job in rx.iter() {
                        job(&mut state);
                    }
                })?;
            workers.push(handle);
        }

        debug!(pool = name, threads, "worker pool started");
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task; blocks while every worker is busy and the queue is full.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::Worker(format!("{} pool is shut down", self.name)))?;
        let (tx, rx) = bounded(1);
        let job: Job<S> = Box::new(move |state| {
            let _ = tx.send(task(state));
        });
        sender
            .send(job)
            .map_err(|_| Error::Worker(format!("{} pool has no live workers", self.name)))?;
        Ok(TaskHandle { rx })
    }

    /// Run `f` over `inputs` in rounds of at most `threads()` tasks,
    /// returning results in input order. A failure is reported once every
    /// task of its round has been reaped.
    pub fn map_ordered<I, T, F>(&self, inputs: Vec<I>, f: F) -> Result<Vec<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(&mut S, I) -> Result<T> + Send + Sync + Clone + 'static,
    {
        let mut out = Vec::with_capacity(inputs.len());
        let mut inputs = inputs.into_iter().peekable();
        while inputs.peek().is_some() {
            let mut handles = Vec::with_capacity(self.threads());
            for input in inputs.by_ref().take(self.threads()) {
                let f = f.clone();
                handles.push(self.submit(move |state| f(state, input))?);
            }
            let mut first_err = None;
            for handle in handles {
                match handle.wait() {
                    Ok(v) => out.push(v),
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
        }
        Ok(out)
    }
}

impl<S: Send + 'static> Drop for WorkerPool<S> {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
