//! Per-thread execution context.
//!
//! Each OS thread that dispatches calls lazily builds its own current-thread
//! tokio runtime and keeps it in thread-local storage. A thread's pending call
//! never shares a scheduler with another thread's, and calls from one thread
//! run one after another in submission order.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use super::errors::DispatchError;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Rc<ExecutionContext>>> = const { RefCell::new(None) };
}

/// A thread-bound scheduler for driving calls to completion.
///
/// Handed out as `Rc`, so it cannot leave its thread.
pub struct ExecutionContext {
    id: u64,
    thread: ThreadId,
    runtime: Option<Runtime>,
}

impl ExecutionContext {
    /// The calling thread's context, created on first use.
    pub fn current() -> Result<Rc<ExecutionContext>, DispatchError> {
        CURRENT
            .try_with(|slot| {
                if let Some(existing) = slot.borrow().as_ref() {
                    return Ok(Rc::clone(existing));
                }
                let context = Rc::new(Self::build()?);
                *slot.borrow_mut() = Some(Rc::clone(&context));
                Ok(context)
            })
            .map_err(|_| DispatchError::ContextUnavailable {
                reason: "thread is shutting down".into(),
            })?
    }

    fn build() -> Result<ExecutionContext, DispatchError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DispatchError::ContextUnavailable {
                reason: format!("failed to build runtime: {e}"),
            })?;
        let context = ExecutionContext {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            thread: std::thread::current().id(),
            runtime: Some(runtime),
        };
        tracing::debug!(
            context = context.id,
            thread = ?context.thread,
            "execution context created"
        );
        Ok(context)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    fn runtime(&self) -> Result<&Runtime, DispatchError> {
        self.runtime.as_ref().ok_or_else(|| DispatchError::ContextUnavailable {
            reason: "runtime already shut down".into(),
        })
    }

    /// Block the calling thread until `future` completes.
    ///
    /// Fails instead of panicking when called from inside another runtime.
    pub fn run<F: Future>(&self, future: F) -> Result<F::Output, DispatchError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(DispatchError::ContextUnavailable {
                reason: "cannot block inside an async runtime; use the async dispatch API".into(),
            });
        }
        Ok(self.runtime()?.block_on(future))
    }

    /// Start `future` on this context without waiting for it.
    ///
    /// It makes progress whenever the thread is inside [`run`](Self::run).
    /// If the context is torn down first, awaiting the returned call yields
    /// `DispatchError::Cancelled`.
    pub fn spawn<F>(&self, label: &str, future: F) -> Result<PendingCall<F::Output>, DispatchError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.runtime()?.spawn(future);
        Ok(PendingCall {
            label: label.to_string(),
            handle,
        })
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Runs from a thread-local destructor; must not block.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            tracing::debug!(context = self.id, "execution context shut down");
        }
    }
}

/// A call spawned on an execution context.
pub struct PendingCall<T> {
    label: String,
    handle: JoinHandle<T>,
}

impl<T> PendingCall<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the result; a torn-down context yields `Cancelled`.
    pub async fn join(self) -> Result<T, DispatchError> {
        match self.handle.await {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(DispatchError::Cancelled { method: self.label }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_same_thread_reuses_context() {
        let a = ExecutionContext::current().unwrap();
        let b = ExecutionContext::current().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.thread(), std::thread::current().id());
    }

    #[test]
    fn test_threads_get_distinct_contexts() {
        let here = ExecutionContext::current().unwrap().id();
        let there = std::thread::spawn(|| ExecutionContext::current().unwrap().id())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_run_blocks_until_complete() {
        let context = ExecutionContext::current().unwrap();
        let value = context
            .run(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                41 + 1
            })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_run_inside_runtime_is_refused() {
        let outer = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let result = outer.block_on(async {
            let context = ExecutionContext::current().unwrap();
            context.run(async { 1 }).map(|_| ())
        });
        assert!(matches!(result, Err(DispatchError::ContextUnavailable { .. })));
    }

    #[test]
    fn test_spawned_work_completes_under_run() {
        let context = ExecutionContext::current().unwrap();
        let pending = context.spawn("add", async { 2 + 2 }).unwrap();
        assert_eq!(pending.label(), "add");
        let value = context.run(pending.join()).unwrap().unwrap();
        assert_eq!(value, 4);
    }

    #[test]
    fn test_pending_call_cancelled_when_thread_exits() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let context = ExecutionContext::current().unwrap();
            let pending = context
                .spawn("UGrpc.SystemUtils.GetProjectInfo", std::future::pending::<()>())
                .unwrap();
            // Hand the pending call out; the thread then exits and drops its context.
            tx.send(pending).unwrap();
        })
        .join()
        .unwrap();

        let pending = rx.recv().unwrap();
        let result = std::thread::spawn(move || {
            let context = ExecutionContext::current().unwrap();
            context.run(pending.join()).unwrap()
        })
        .join()
        .unwrap();

        match result {
            Err(DispatchError::Cancelled { method }) => {
                assert_eq!(method, "UGrpc.SystemUtils.GetProjectInfo");
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
