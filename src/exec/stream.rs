use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use data_model::Slice;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::RunError;

/// Runs one sampled slice through a pipeline.
#[async_trait]
pub trait SliceRunner: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn run_slice(&self, slice: &Slice) -> Result<Self::Output, RunError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,
    #[error("sampler has no more slices")]
    SampleExhausted,
    #[error("selector rejected the slice")]
    Rejected,
    #[error(transparent)]
    Run(anyhow::Error),
}

pub type Sampler = Arc<dyn Fn() -> Option<Slice> + Send + Sync>;

/// Receives every outcome. Results and failures consume demand; rejections
/// do not.
pub type Callback<T> = Arc<dyn Fn(Option<Slice>, Result<T, StreamError>) + Send + Sync>;

struct State<T> {
    remaining: usize,
    workers: usize,
    closed: bool,
    /// Results finished after demand hit zero, delivered by the next `get`.
    extras: VecDeque<(Slice, T)>,
}

struct Inner<R: SliceRunner> {
    runner: Arc<R>,
    sampler: Sampler,
    callback: Callback<R::Output>,
    per_iter: usize,
    state: Mutex<State<R::Output>>,
    workers_tx: watch::Sender<usize>,
}

/// Samples slices and runs them with at most `per_iter` slices in flight,
/// delivering exactly as many results as were requested with `get`.
pub struct ExecStream<R: SliceRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: SliceRunner> ExecStream<R> {
    pub fn new(
        runner: Arc<R>,
        sampler: Sampler,
        per_iter: usize,
        callback: Callback<R::Output>,
    ) -> Self {
        let (workers_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                runner,
                sampler,
                callback,
                per_iter: per_iter.max(1),
                state: Mutex::new(State {
                    remaining: 0,
                    workers: 0,
                    closed: false,
                    extras: VecDeque::new(),
                }),
                workers_tx,
            }),
        }
    }

    /// Requests `n` more results.
    pub fn get(&self, n: usize) {
        let inner = &self.inner;
        let mut ready = Vec::new();
        let spawn;
        {
            let mut state = inner.state.lock();
            if state.closed {
                drop(state);
                for _ in 0..n {
                    (inner.callback)(None, Err(StreamError::Closed));
                }
                return;
            }
            state.remaining += n;
            inner.drain_extras(&mut state, &mut ready);
            spawn = if state.remaining > 0 {
                inner.per_iter.saturating_sub(state.workers)
            } else {
                0
            };
            state.workers += spawn;
            inner.workers_tx.send_replace(state.workers);
        }
        for (slice, output) in ready {
            (inner.callback)(Some(slice), Ok(output));
        }
        debug!(n, spawn, "exec stream demand added");
        for _ in 0..spawn {
            tokio::spawn(Inner::worker(inner.clone()));
        }
    }

    /// Stops sampling. Slices already running finish and are delivered.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
    }

    /// Resolves once every worker has exited.
    pub async fn wait(&self) {
        let mut rx = self.inner.workers_tx.subscribe();
        let _ = rx.wait_for(|workers| *workers == 0).await;
    }
}

impl<R: SliceRunner> Inner<R> {
    fn drain_extras(&self, state: &mut State<R::Output>, ready: &mut Vec<(Slice, R::Output)>) {
        while state.remaining > 0 {
            let Some(extra) = state.extras.pop_front() else {
                break;
            };
            state.remaining -= 1;
            ready.push(extra);
        }
    }

    /// Leaves the pool. Must be called with the decision to exit made under
    /// the same lock so that `get` never counts a departing worker.
    fn exit(&self, state: &mut State<R::Output>) {
        state.workers -= 1;
        self.workers_tx.send_replace(state.workers);
    }

    async fn worker(self: Arc<Self>) {
        loop {
            let mut ready = Vec::new();
            {
                let mut state = self.state.lock();
                self.drain_extras(&mut state, &mut ready);
                if state.closed || state.remaining == 0 {
                    self.exit(&mut state);
                    drop(state);
                    for (slice, output) in ready {
                        (self.callback)(Some(slice), Ok(output));
                    }
                    return;
                }
            }
            for (slice, output) in ready {
                (self.callback)(Some(slice), Ok(output));
            }

            let Some(slice) = (0..self.per_iter).find_map(|_| (self.sampler)()) else {
                let pending = {
                    let mut state = self.state.lock();
                    self.exit(&mut state);
                    if state.workers == 0 {
                        std::mem::take(&mut state.remaining)
                    } else {
                        0
                    }
                };
                if pending > 0 {
                    warn!(pending, "sampler exhausted with outstanding demand");
                }
                for _ in 0..pending {
                    (self.callback)(None, Err(StreamError::SampleExhausted));
                }
                return;
            };

            match self.runner.run_slice(&slice).await {
                Err(RunError::SelectorReject) => {
                    (self.callback)(Some(slice), Err(StreamError::Rejected));
                }
                Err(RunError::Failed(err)) => {
                    let deliver = {
                        let mut state = self.state.lock();
                        if state.remaining > 0 {
                            state.remaining -= 1;
                            true
                        } else {
                            false
                        }
                    };
                    if deliver {
                        (self.callback)(Some(slice), Err(StreamError::Run(err)));
                    } else {
                        warn!(slice = %slice, "dropping failure after demand was met: {:?}", err);
                    }
                }
                Ok(output) => {
                    let output = {
                        let mut state = self.state.lock();
                        if state.remaining > 0 {
                            state.remaining -= 1;
                            Some(output)
                        } else {
                            state.extras.push_back((slice.clone(), output));
                            None
                        }
                    };
                    if let Some(output) = output {
                        (self.callback)(Some(slice), Ok(output));
                    }
                }
            }
        }
    }
}
