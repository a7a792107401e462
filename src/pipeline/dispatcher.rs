use std::{
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::{Result, TransportError};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed size pool of worker threads fed by an unbounded queue.
///
/// With zero workers, or once [`join`](Dispatcher::join) has been called,
/// tasks run inline on the dispatching thread.
pub struct Dispatcher {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Ok(Self {
                sender: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                concurrency,
            });
        }

        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(concurrency);
        for idx in 0..concurrency {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("dispatcher-{idx}"))
                .spawn(move || work(receiver))
                .map_err(TransportError::Spawn)?;
            workers.push(worker);
        }
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            concurrency,
        })
    }

    #[inline]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        let task = match self.sender.lock().as_ref() {
            Some(sender) => match sender.send(task) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            None => task,
        };
        run(task);
    }

    /// Stop accepting queued work, let the workers finish what is queued and
    /// wait for them to exit.
    pub fn join(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Workers exit once the queue is drained.
        drop(self.sender.get_mut().take());
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("concurrency", &self.concurrency)
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}

fn work(receiver: Receiver<Task>) {
    while let Ok(task) = receiver.recv() {
        run(task);
    }
}

fn run(task: Task) {
    if let Err(_panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        #[cfg(feature = "logging")]
        tracing::error!("dispatched task panicked: {}", panic_message(&*_panic));
    }
}

#[cfg(feature = "logging")]
fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crossbeam_channel::bounded;

    use super::*;

    #[test]
    fn runs_on_workers() {
        let dispatcher = Dispatcher::new(2).unwrap();
        let (tx, rx) = bounded(1);
        let caller = thread::current().id();
        dispatcher.dispatch(move || {
            tx.send(thread::current().id()).unwrap();
        });
        let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(worker, caller);
        dispatcher.join();
    }

    #[test]
    fn zero_workers_run_inline() {
        let dispatcher = Dispatcher::new(0).unwrap();
        let caller = thread::current().id();
        let ran = Arc::new(Mutex::new(None));
        let slot = ran.clone();
        dispatcher.dispatch(move || *slot.lock() = Some(thread::current().id()));
        assert_eq!(*ran.lock(), Some(caller));
    }

    #[test]
    fn panicking_task_keeps_worker_alive() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dispatcher = Dispatcher::new(1).unwrap();
        dispatcher.dispatch(|| panic!("boom"));
        let (tx, rx) = bounded(1);
        dispatcher.dispatch(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        dispatcher.join();
    }

    #[test]
    fn join_drains_queue() {
        let dispatcher = Dispatcher::new(3).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = count.clone();
            dispatcher.dispatch(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher.join();
        assert_eq!(count.load(Ordering::SeqCst), 100);

        // Closed dispatchers run inline.
        let count2 = count.clone();
        dispatcher.dispatch(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 101);
    }
}
