use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::trace;

pub(crate) type ParseTask = Box<dyn FnOnce() + Send + 'static>;

/// Small worker pool for the CPU heavy parse work of LOD and skin
/// bytes. The queue is bounded, when a post does not go through the
/// caller parses inline instead of blocking the repo worker.
pub(crate) struct ParsePool {
    sender: Mutex<Option<SyncSender<ParseTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

const QUEUE_DEPTH: usize = 128;

impl ParsePool {
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = sync_channel::<ParseTask>(QUEUE_DEPTH);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("mesh-parse-{}", i))
                    .spawn(move || Self::worker_loop(receiver))
                    .expect("spawning parse pool worker")
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    fn worker_loop(receiver: Arc<Mutex<Receiver<ParseTask>>>) {
        loop {
            let task = {
                let guard = receiver.lock().expect("poisoned lock");
                guard.recv()
            };
            match task {
                Ok(task) => task(),
                Err(_) => break, // pool shut down
            }
        }
        trace!("Parse pool worker exiting");
    }

    /// Hands a task to the pool. The task comes back when the pool is
    /// saturated or already shut down, the caller then runs it inline.
    pub fn post(&self, task: ParseTask) -> Result<(), ParseTask> {
        let guard = self.sender.lock().expect("poisoned lock");
        match guard.as_ref() {
            Some(sender) => match sender.try_send(task) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => Err(task),
            },
            None => Err(task),
        }
    }

    /// Closes the queue and waits for the workers. Queued tasks still
    /// run, they bail out early through the repository's quitting flag.
    pub fn shutdown(&self) {
        self.sender.lock().expect("poisoned lock").take();
        let workers = std::mem::take(&mut *self.workers.lock().expect("poisoned lock"));
        for worker in workers {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_on_the_pool() {
        let pool = ParsePool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let counter = counter.clone();
            let task: ParseTask = Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            if let Err(task) = pool.post(task) {
                task();
            }
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn post_after_shutdown_returns_the_task() {
        let pool = ParsePool::new(1);
        pool.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_task = ran.clone();
        let task: ParseTask = Box::new(move || {
            ran_in_task.fetch_add(1, Ordering::SeqCst);
        });

        let rejected = pool.post(task).expect_err("pool is closed");
        rejected();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
