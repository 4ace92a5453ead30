//! Pulls a stream into a callback on a background task until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::warn;

type Callback<T> = Box<dyn FnMut(T) + Send>;
type Parts<T> = (BoxStream<'static, T>, Callback<T>);

enum State<T> {
    Idle(Parts<T>),
    /// The loop hands the source and callback back when it stops, or
    /// `None` if the source ran out.
    Running(JoinHandle<Option<Parts<T>>>),
    Finished,
}

pub struct CancellableDriver<T> {
    state: State<T>,
    running: Arc<AtomicBool>,
}

impl<T: Send + 'static> CancellableDriver<T> {
    pub fn new<S, F>(source: S, callback: F) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        Self {
            state: State::Idle((source.boxed(), Box::new(callback))),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start pulling. No-op if already running or finished.
    pub fn start(&mut self) -> &mut Self {
        if !matches!(self.state, State::Idle(_)) {
            return self;
        }
        let State::Idle((mut source, mut callback)) = std::mem::replace(&mut self.state, State::Finished)
        else {
            return self;
        };

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        self.state = State::Running(tokio::spawn(async move {
            while running.load(Ordering::Acquire) {
                match source.next().await {
                    Some(value) => callback(value),
                    None => return None,
                }
            }
            Some((source, callback))
        }));
        self
    }

    /// Clear the running flag and wait for the in-flight pull and callback
    /// to finish. No callback runs after this returns. The driver can be
    /// started again unless its source ran out.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if !matches!(self.state, State::Running(_)) {
            return;
        }
        let State::Running(handle) = std::mem::replace(&mut self.state, State::Finished) else {
            return;
        };
        self.state = match handle.await {
            Ok(Some(parts)) => State::Idle(parts),
            Ok(None) => State::Finished,
            Err(e) => {
                warn!("driver loop ended abnormally: {}", e);
                State::Finished
            }
        };
    }

    pub fn is_running(&self) -> bool {
        matches!(&self.state, State::Running(h) if !h.is_finished())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }
}

impl<T> Drop for CancellableDriver<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let State::Running(handle) = &self.state {
            handle.abort();
        }
    }
}
