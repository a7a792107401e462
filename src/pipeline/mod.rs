//! Background multiplexing of many transfers on one engine.
//!
//! [`Pipeline::add`] queues a transfer; the pipeline thread registers it with
//! its [`MultiEngine`], drives the engine and hands every finished transfer
//! back to its callback on a [`Dispatcher`] worker.
mod dispatcher;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
pub use dispatcher::Dispatcher;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::{
    secs,
    transfer::{Completion, MultiEngine, Token},
    Result, TransferError, TransportError,
};

pub type Callback<H> = Box<dyn FnOnce(H, std::result::Result<(), TransferError>) + Send>;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on each blocking wait of the pipeline thread.
    #[serde(deserialize_with = "secs::deserialize")]
    pub poll_interval: Duration,
    /// Dispatcher workers; 0 runs callbacks on the pipeline thread.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            workers: 2,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

struct Submission<H> {
    handle: H,
    callback: Callback<H>,
}

pub struct Pipeline<H> {
    terminated: Arc<AtomicBool>,
    submit_tx: Sender<Submission<H>>,
    submit_rx: Mutex<Option<Receiver<Submission<H>>>>,
    dispatcher: Arc<Dispatcher>,
    config: PipelineConfig,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<H: Send + 'static> Pipeline<H> {
    /// Pipeline with its own dispatcher of `config.workers` threads.
    pub fn with_config(config: PipelineConfig) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(config.workers)?);
        Ok(Self::new(dispatcher, config))
    }

    pub fn new(dispatcher: Arc<Dispatcher>, config: PipelineConfig) -> Self {
        let (submit_tx, submit_rx) = unbounded();
        Self {
            terminated: Arc::new(AtomicBool::new(false)),
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            dispatcher,
            config,
            thread: Mutex::new(None),
        }
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[inline]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Queue a transfer. `callback` receives the handle back together with
    /// the outcome, exactly once, unless the pipeline is terminated first.
    ///
    /// Transfers queued before [`start`](Self::start) are picked up once it
    /// runs. On a closed pipeline the handle is dropped.
    pub fn add<F>(&self, handle: H, callback: F) -> Result<()>
    where
        F: FnOnce(H, std::result::Result<(), TransferError>) + Send + 'static,
    {
        if self.is_terminated() {
            return Err(TransportError::PipelineClosed);
        }
        self.submit_tx
            .send(Submission {
                handle,
                callback: Box::new(callback),
            })
            .map_err(|_| TransportError::PipelineClosed)
    }

    /// Spawn the pipeline thread. The engine is built on that thread, so it
    /// need not be `Send`.
    pub fn start<E, F>(&self, make_engine: F) -> Result<()>
    where
        E: MultiEngine<Handle = H>,
        F: FnOnce() -> E + Send + 'static,
    {
        let mut thread = self.thread.lock();
        let receiver = self
            .submit_rx
            .lock()
            .take()
            .ok_or(TransportError::PipelineStarted)?;
        let terminated = self.terminated.clone();
        let dispatcher = self.dispatcher.clone();
        let poll_interval = self.config.poll_interval;
        let handle = thread::Builder::new()
            .name("pipeline".to_string())
            .spawn(move || {
                Driver {
                    engine: make_engine(),
                    pending: HashMap::new(),
                    receiver,
                    dispatcher,
                    terminated,
                    poll_interval,
                }
                .run()
            })
            .map_err(TransportError::Spawn)?;
        *thread = Some(handle);
        Ok(())
    }

    /// Ask the pipeline thread to stop after its current iteration. Pending
    /// transfers are abandoned without invoking their callbacks.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Wait for the pipeline thread to exit.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                #[cfg(feature = "logging")]
                tracing::error!("pipeline thread panicked");
            }
        }
    }
}

impl<H> Drop for Pipeline<H> {
    fn drop(&mut self) {
        self.terminated.store(true, Ordering::Release);
    }
}

impl<H> std::fmt::Debug for Pipeline<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .field("queued", &self.submit_tx.len())
            .finish()
    }
}

struct Driver<E: MultiEngine> {
    engine: E,
    pending: HashMap<Token, Callback<E::Handle>>,
    receiver: Receiver<Submission<E::Handle>>,
    dispatcher: Arc<Dispatcher>,
    terminated: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl<E: MultiEngine> Driver<E> {
    #[inline]
    fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn run(mut self) {
        #[cfg(feature = "logging")]
        tracing::debug!("pipeline started");
        while !self.terminated() {
            if !self.accept() && self.pending.is_empty() {
                break;
            }
            if let Err(e) = self.drive() {
                self.abort(e);
                break;
            }
            if self.terminated() {
                break;
            }
            if self.complete() > 0 {
                continue;
            }
            if self.pending.is_empty() {
                match self.receiver.recv_timeout(self.poll_interval) {
                    Ok(submission) => self.register(submission),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else if let Err(e) = self.engine.poll(self.poll_interval) {
                self.abort(e);
                break;
            }
        }
        #[cfg(feature = "logging")]
        tracing::debug!("pipeline stopped with {} pending", self.pending.len());
    }

    /// Register queued submissions. False once every sender is gone.
    fn accept(&mut self) -> bool {
        while !self.terminated() {
            match self.receiver.try_recv() {
                Ok(submission) => self.register(submission),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
        true
    }

    fn register(&mut self, submission: Submission<E::Handle>) {
        let Submission { handle, callback } = submission;
        match self.engine.add_handle(handle) {
            Ok(token) => {
                #[cfg(feature = "logging")]
                tracing::debug!("transfer {:?} submitted", token);
                self.pending.insert(token, callback);
            }
            Err((handle, e)) => {
                #[cfg(feature = "logging")]
                tracing::debug!("transfer rejected by engine: {}", e);
                self.dispatcher.dispatch(move || callback(handle, Err(e)));
            }
        }
    }

    fn drive(&mut self) -> std::result::Result<(), TransferError> {
        loop {
            let status = self.engine.perform()?;
            if !status.call_again || self.terminated() {
                return Ok(());
            }
        }
    }

    /// Hand finished transfers to their callbacks; returns how many.
    fn complete(&mut self) -> usize {
        let done = self.engine.drain_completions();
        let count = done.len();
        for Completion { token, result } in done {
            let Some(callback) = self.pending.remove(&token) else {
                continue;
            };
            match self.engine.remove_handle(token) {
                Some(handle) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!("transfer {:?} finished, ok: {}", token, result.is_ok());
                    self.dispatcher.dispatch(move || callback(handle, result));
                }
                None => {
                    #[cfg(feature = "logging")]
                    tracing::error!("engine lost handle for transfer {:?}", token);
                }
            }
        }
        count
    }

    /// The engine itself failed: fail everything in flight or queued and
    /// close the pipeline.
    fn abort(&mut self, error: TransferError) {
        #[cfg(feature = "logging")]
        tracing::error!("multiplexed engine failed: {}", error);
        self.terminated.store(true, Ordering::Release);

        for (token, callback) in std::mem::take(&mut self.pending) {
            if let Some(handle) = self.engine.remove_handle(token) {
                let error = error.clone();
                self.dispatcher.dispatch(move || callback(handle, Err(error)));
            }
        }
        while let Ok(Submission { handle, callback }) = self.receiver.try_recv() {
            let error = error.clone();
            self.dispatcher.dispatch(move || callback(handle, Err(error)));
        }
    }
}
