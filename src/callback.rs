//! Completion callbacks for submitted frames.
//!
//! Every entry handed to the flusher carries a callback that is
//! completed exactly once, after the frame's bytes have been written to
//! the transport (or when the submission fails). Callbacks declare an
//! invocation type: non-blocking callbacks may be invoked inline on the
//! writer thread, blocking ones are dispatched off-thread so the single
//! writer is never stalled by application code.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// How a callback may be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// The callback may block; it must not run on the writer thread.
    Blocking,
    /// The callback completes promptly and can be inlined anywhere.
    NonBlocking,
}

type Task = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// A one-shot completion callback.
pub struct Callback {
    task: Option<Task>,
    invocation: Invocation,
}

impl Callback {
    /// A callback that does nothing.
    pub fn noop() -> Self {
        Callback {
            task: None,
            invocation: Invocation::NonBlocking,
        }
    }

    /// A non-blocking callback, safe to inline on the writer thread.
    pub fn non_blocking<F>(f: F) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        Callback {
            task: Some(Box::new(f)),
            invocation: Invocation::NonBlocking,
        }
    }

    /// A callback that may block; completion is dispatched off-thread.
    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        Callback {
            task: Some(Box::new(f)),
            invocation: Invocation::Blocking,
        }
    }

    /// The declared invocation type.
    pub fn invocation(&self) -> Invocation {
        self.invocation
    }

    /// Complete successfully.
    pub fn succeeded(self) {
        self.complete(Ok(()));
    }

    /// Complete with a failure.
    pub fn failed(self, error: Error) {
        self.complete(Err(error));
    }

    fn complete(mut self, result: Result<()>) {
        if let Some(task) = self.task.take() {
            match self.invocation {
                Invocation::NonBlocking => task(result),
                Invocation::Blocking => {
                    std::thread::spawn(move || task(result));
                }
            }
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("invocation", &self.invocation)
            .field("armed", &self.task.is_some())
            .finish()
    }
}

struct CountingState {
    remaining: AtomicUsize,
    failure: Mutex<Option<Error>>,
    inner: Mutex<Option<Callback>>,
}

/// Split one callback into `count` callbacks: the inner callback fires
/// once all of them have completed, failing if any of them failed.
///
/// Used when one submission fans out into several frames and only the
/// last write should complete the caller.
pub fn counting(inner: Callback, count: usize) -> Vec<Callback> {
    assert!(count > 0, "counting callback needs at least one part");
    let state = Arc::new(CountingState {
        remaining: AtomicUsize::new(count),
        failure: Mutex::new(None),
        inner: Mutex::new(Some(inner)),
    });
    (0..count)
        .map(|_| {
            let state = Arc::clone(&state);
            Callback::non_blocking(move |result| {
                if let Err(e) = result {
                    let mut failure = state.failure.lock().unwrap();
                    failure.get_or_insert(e);
                }
                if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let inner = state.inner.lock().unwrap().take();
                    if let Some(inner) = inner {
                        let failure = state.failure.lock().unwrap().take();
                        match failure {
                            Some(e) => inner.failed(e),
                            None => inner.succeeded(),
                        }
                    }
                }
            })
        })
        .collect()
}
