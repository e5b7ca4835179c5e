//! Runtime abstraction layer for async operations
//!
//! Tile loads are the only suspending work in the engine. They are spawned
//! through this module so the scheduler does not depend on a specific
//! executor: tokio when the `tokio-runtime` feature is on, a thread-per-task
//! fallback otherwise, or anything installed with [`init_runtime`].

use crate::prelude::{Future, Pin};

/// A trait for spawning async tasks (object-safe version)
pub trait AsyncSpawner: Send + Sync + 'static {
    /// Spawn a future and return a handle to it
    fn spawn_boxed(
        &self,
        future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn AsyncHandle>;
}

/// Handle to a spawned async task
pub trait AsyncHandle: Send + Sync {
    /// Check if the task is finished
    fn is_finished(&self) -> bool;

    /// Abort the task; tile loads prefer cooperative cancellation through
    /// their cancel token, this is the hard stop
    fn cancel(&self);
}

/// Spawn a future on the installed runtime
pub fn spawn<F>(future: F) -> Box<dyn AsyncHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    runtime().spawn_boxed(Box::pin(future))
}

/// Default spawner implementations
pub mod spawners {
    use super::*;

    #[cfg(feature = "tokio-runtime")]
    pub mod tokio_impl {
        use super::*;
        use ::tokio::task::JoinHandle;

        /// Tokio-based async spawner
        ///
        /// Spawns onto the runtime of the calling context; outside of one it
        /// falls back to the thread spawner instead of panicking.
        pub struct TokioSpawner;

        impl AsyncSpawner for TokioSpawner {
            fn spawn_boxed(
                &self,
                future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
            ) -> Box<dyn AsyncHandle> {
                match ::tokio::runtime::Handle::try_current() {
                    Ok(runtime) => Box::new(TokioHandle(runtime.spawn(future))),
                    Err(_) => super::thread_impl::ThreadSpawner.spawn_boxed(future),
                }
            }
        }

        struct TokioHandle(JoinHandle<()>);

        impl AsyncHandle for TokioHandle {
            fn is_finished(&self) -> bool {
                self.0.is_finished()
            }

            fn cancel(&self) {
                self.0.abort();
            }
        }
    }

    pub mod thread_impl {
        use super::*;
        use crate::prelude::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        /// Runs every future to completion on its own OS thread.
        ///
        /// Load timeouts on these threads share a single timer thread.
        pub struct ThreadSpawner;

        impl AsyncSpawner for ThreadSpawner {
            fn spawn_boxed(
                &self,
                future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
            ) -> Box<dyn AsyncHandle> {
                let finished = Arc::new(AtomicBool::new(false));
                let finished_clone = finished.clone();
                std::thread::spawn(move || {
                    futures::executor::block_on(future);
                    finished_clone.store(true, Ordering::Release);
                });
                Box::new(ThreadHandle { finished })
            }
        }

        struct ThreadHandle {
            finished: Arc<AtomicBool>,
        }

        impl AsyncHandle for ThreadHandle {
            fn is_finished(&self) -> bool {
                self.finished.load(Ordering::Acquire)
            }

            fn cancel(&self) {
                // Threads can't be aborted; loads observe their cancel token instead
            }
        }
    }
}

/// Async helpers shared by the loader
pub mod async_utils {
    use crate::prelude::{BinaryHeap, Ordering};
    use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
    use futures::channel::oneshot;
    use instant::Instant;
    use once_cell::sync::Lazy;
    use std::time::Duration;

    /// Heap size above which abandoned timers are swept out
    const SWEEP_THRESHOLD: usize = 256;

    struct TimerRequest {
        deadline: Instant,
        wake: oneshot::Sender<()>,
    }

    impl PartialEq for TimerRequest {
        fn eq(&self, other: &Self) -> bool {
            self.deadline == other.deadline
        }
    }

    impl Eq for TimerRequest {}

    impl PartialOrd for TimerRequest {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for TimerRequest {
        // Earliest deadline on top of the max-heap
        fn cmp(&self, other: &Self) -> Ordering {
            other.deadline.cmp(&self.deadline)
        }
    }

    /// One thread serves every delay outside tokio
    static TIMER: Lazy<Option<Sender<TimerRequest>>> = Lazy::new(|| {
        let (tx, rx) = unbounded();
        std::thread::Builder::new()
            .name("maplet-timer".into())
            .spawn(move || run_timer(rx))
            .map_err(|e| log::error!("failed to start timer thread: {}", e))
            .ok()?;
        Some(tx)
    });

    fn run_timer(requests: Receiver<TimerRequest>) {
        let mut timers = BinaryHeap::new();
        loop {
            let now = Instant::now();
            while timers
                .peek()
                .is_some_and(|timer: &TimerRequest| timer.deadline <= now)
            {
                if let Some(timer) = timers.pop() {
                    let _ = timer.wake.send(());
                }
            }

            let next = match timers.peek() {
                Some(timer) => match requests.recv_timeout(timer.deadline - now) {
                    Ok(request) => Some(request),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match requests.recv() {
                    Ok(request) => Some(request),
                    Err(_) => return,
                },
            };

            if let Some(request) = next {
                timers.push(request);
                // loads that finished early drop their receiver
                if timers.len() > SWEEP_THRESHOLD {
                    timers.retain(|timer| !timer.wake.is_canceled());
                }
            }
        }
    }

    /// Runtime-agnostic sleep
    pub async fn async_delay(duration: Duration) {
        #[cfg(feature = "tokio-runtime")]
        {
            if ::tokio::runtime::Handle::try_current().is_ok() {
                ::tokio::time::sleep(duration).await;
                return;
            }
        }

        let (wake, done) = oneshot::channel();
        let request = TimerRequest {
            deadline: Instant::now() + duration,
            wake,
        };
        let request = match TIMER.as_ref() {
            Some(timer) => timer.send(request).err().map(|e| e.into_inner()),
            None => Some(request),
        };
        if let Some(request) = request {
            std::thread::spawn(move || {
                std::thread::sleep(duration);
                let _ = request.wake.send(());
            });
        }
        let _ = done.await;
    }
}

/// Global runtime instance
static RUNTIME: std::sync::OnceLock<Box<dyn AsyncSpawner>> = std::sync::OnceLock::new();

/// Initialize the runtime with a specific spawner.
///
/// Must be called before the first load is spawned; later calls are ignored.
pub fn init_runtime(spawner: Box<dyn AsyncSpawner>) {
    if RUNTIME.set(spawner).is_err() {
        log::debug!("runtime already initialized, keeping the existing spawner");
    }
}

/// Get the global runtime spawner
pub fn runtime() -> &'static dyn AsyncSpawner {
    RUNTIME
        .get_or_init(|| {
            #[cfg(feature = "tokio-runtime")]
            {
                Box::new(spawners::tokio_impl::TokioSpawner) as Box<dyn AsyncSpawner>
            }

            #[cfg(not(feature = "tokio-runtime"))]
            {
                log::info!("tokio-runtime disabled, spawning tile loads on threads");
                Box::new(spawners::thread_impl::ThreadSpawner) as Box<dyn AsyncSpawner>
            }
        })
        .as_ref()
}
