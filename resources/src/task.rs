//! This module provides the worker pool used to run blocking units of work in the background.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The pool has been shut down and does not accept tasks anymore.
    #[error("worker pool is stopped")]
    Stopped,
    /// The task panicked while running on a worker.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task was dropped without producing any result.
    #[error("task was dropped before completion")]
    Canceled,
}

/// A fixed-size pool of worker threads processing blocking tasks in the background.
///
/// # Keep control over tasks
/// Tasks returning any `T: Send` are pushed with [`Pool::submit()`], which returns a [`Handle`] on the task result.
/// The handle can be read synchronously with [`Handle::get()`] or awaited since it implements [`Future`].
///
/// # Forget tasks
/// Tasks returning `()` can just be pushed and forgotten using [`Pool::forget()`].
///
/// # Shutdown
/// [`Pool::shutdown()`] (also run on drop) stops accepting tasks, lets the workers drain every task queued so far
/// and joins them.
///
/// # Example
/// ```
/// # use std::num::NonZeroUsize;
/// # use resources::task::Pool;
/// let pool = Pool::new(NonZeroUsize::new(3).unwrap());
///
/// let handles: Vec<_> = (0..=5).map(|i| pool.submit(move || i * i).unwrap()).collect();
///
/// pool.shutdown();
///
/// let squares: Vec<_> = handles.into_iter().map(|handle| handle.get().unwrap()).collect();
/// assert_eq!(squares, [0, 1, 4, 9, 16, 25]);
/// ```
#[derive(Debug)]
pub struct Pool {
    /// The pool of workers, emptied once joined.
    workers: Mutex<Vec<Worker>>,
    /// The sending part of a channel to push tasks to the workers.
    ///
    /// The next available worker will wait for a task to be received through the channel.
    /// Taking it out marks the pool as stopped.
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    size: NonZeroUsize,
}

impl Pool {
    /// Start a pool with `size` workers.
    ///
    /// # Panics
    /// This method panics if the operating system refuses to spawn a worker thread.
    pub fn new(size: NonZeroUsize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let receiver = Arc::new(Mutex::new(receiver));

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let id = WORKER_ID.fetch_add(size.get(), Ordering::Relaxed);

        let workers = (0..size.get()).map(|i| Worker::new(id.wrapping_add(i), Arc::clone(&receiver))).collect();

        Self {
            workers: Mutex::new(workers),
            sender: Mutex::new(Some(sender)),
            size,
        }
    }

    /// Number of workers this pool was started with.
    #[inline]
    pub fn size(&self) -> NonZeroUsize {
        self.size
    }

    /// Whether [`Pool::shutdown()`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }

    /// Send a task and keep a handle on its result.
    ///
    /// A panic raised by `task` is caught on the worker and only surfaces when reading the handle:
    /// ```
    /// # use std::num::NonZeroUsize;
    /// # use resources::task::{Error, Pool};
    /// # let pool = Pool::new(NonZeroUsize::new(1).unwrap());
    /// let handle = pool.submit(|| -> u32 { panic!("no way") }).unwrap();
    ///
    /// assert_eq!(handle.get(), Err(Error::Panicked("no way".into())));
    /// ```
    ///
    /// Once the pool has been shut down, the task is rejected and never runs:
    /// ```
    /// # use std::num::NonZeroUsize;
    /// # use resources::task::{Error, Pool};
    /// # let pool = Pool::new(NonZeroUsize::new(1).unwrap());
    /// pool.shutdown();
    ///
    /// assert_eq!(pool.submit(|| "Hello world!").unwrap_err(), Error::Stopped);
    /// ```
    pub fn submit<T, F>(&self, task: F) -> Result<Handle<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        self.push(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task)).map_err(|payload| Error::Panicked(panic_message(payload)));

            // the handle may have been dropped already, nobody is waiting for the result then
            let _ = sender.send(result);
        }))?;

        Ok(Handle { receiver })
    }

    /// Send a task and forget it.
    ///
    /// A panic raised by `task` is caught and logged, the worker keeps running.
    pub fn forget(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        self.push(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                tracing::debug!("Forgotten task panicked: {}", panic_message(payload));
            }
        }))
    }

    fn push(&self, task: Task) -> Result<(), Error> {
        match *self.sender.lock().unwrap() {
            Some(ref sender) => sender.send(task).map_err(|_| Error::Stopped),
            None => Err(Error::Stopped),
        }
    }

    /// Stop the pool, waiting for all pending tasks to complete.
    ///
    /// Tasks queued before this call are still executed; tasks submitted afterwards are rejected with
    /// [`Error::Stopped`]. Calling it more than once is harmless.
    pub fn shutdown(&self) {
        // closing the channel lets the workers exit once every queued task has been received
        if self.sender.lock().unwrap().take().is_some() {
            tracing::debug!("Shutting down pool of {} workers...", self.size);
        }

        // joining outside the lock lets a task shut its own pool down concurrently
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());

        for worker in workers {
            tracing::debug!("Stopping worker {}...", worker.id);

            // a worker shutting down its own pool cannot join itself
            if worker.handle.thread().id() != thread::current().id() {
                let _ = worker.handle.join();
            }
        }
    }
}

impl Default for Pool {
    /// Start a pool with as many workers as the available hardware parallelism.
    fn default() -> Self {
        Self::new(thread::available_parallelism().unwrap_or(NonZeroUsize::MIN))
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>) -> Worker {
        tracing::debug!("Starting worker {id}...");

        let handle = thread::Builder::new()
            .name(format!("resources-worker-{id}"))
            .spawn(move || loop {
                // the receiver lock is released before running the task
                let message = receiver.lock().unwrap().blocking_recv();

                match message {
                    Some(task) => {
                        tracing::trace!("Executing task on worker {id}...");

                        task();
                    }
                    None => {
                        tracing::debug!("All tasks exhausted, shutting down worker {id}.");
                        break;
                    }
                }
            })
            .expect("worker thread cannot be spawned");

        Worker { id, handle }
    }
}

/// A handle on the result of a task sent with [`Pool::submit()`].
///
/// Dropping it does not cancel the task, its result is just discarded.
#[must_use = "dropping a handle discards the task result"]
pub struct Handle<T> {
    receiver: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Handle<T> {
    /// Block the current thread until the task completes and return its result.
    ///
    /// In an asynchronous context, prefer awaiting the handle itself:
    /// ```
    /// # tokio_test::block_on(async {
    /// # use std::num::NonZeroUsize;
    /// # use resources::task::Pool;
    /// # let pool = Pool::new(NonZeroUsize::new(2).unwrap());
    /// let handle = pool.submit(|| "Hello world!").unwrap();
    ///
    /// if let Ok(msg) = handle.await {
    ///     println!("{msg}");
    /// }
    /// # })
    /// ```
    pub fn get(self) -> Result<T, Error> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, Error>;

    #[inline]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // the sender is only dropped without sending if the task itself was dropped
        Pin::new(&mut self.receiver).poll(cx).map(|result| result.unwrap_or(Err(Error::Canceled)))
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast_ref::<&str>() {
            Some(msg) => msg.to_string(),
            None => "Box<dyn Any>".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pool(size: usize) -> Pool {
        Pool::new(size.try_into().unwrap())
    }

    #[test]
    fn test_submit() {
        let pool = pool(2);

        let handle = pool.submit(|| 6 * 7).unwrap();

        assert_eq!(handle.get(), Ok(42));
    }

    #[test]
    fn test_default_size() {
        let pool = Pool::default();

        assert!(pool.size().get() >= 1);
        assert!(!pool.is_stopped());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_shutdown_drains_queue() {
        let pool = pool(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert!(handles.into_iter().all(|handle| handle.get().is_ok()));
        assert!(logs_contain("Stopping worker"));
    }

    #[test]
    fn test_shutdown_mid_queue() {
        let pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.forget(move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        // most tasks are still queued at this point
        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let pool = pool(1);

            for _ in 0..5 {
                let counter = Arc::clone(&counter);
                pool.forget(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }

        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_rejected_after_shutdown() {
        let pool = pool(2);
        pool.shutdown();
        pool.shutdown();

        assert!(pool.is_stopped());
        assert_eq!(pool.submit(|| ()).unwrap_err(), Error::Stopped);
        assert_eq!(pool.forget(|| ()), Err(Error::Stopped));
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let pool = pool(1);

        let failed = pool.submit(|| -> u8 { panic!("faulty task #{}", 1) }).unwrap();
        let forgotten = pool.forget(|| panic!("forgotten"));
        let succeeded = pool.submit(|| "still alive").unwrap();

        assert_eq!(failed.get(), Err(Error::Panicked("faulty task #1".into())));
        assert_eq!(forgotten, Ok(()));
        assert_eq!(succeeded.get(), Ok("still alive"));
    }

    #[test]
    fn test_dropped_handle() {
        let pool = pool(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let task_counter = Arc::clone(&counter);
        drop(pool.submit(move || task_counter.fetch_add(1, Ordering::SeqCst)).unwrap());

        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_from_worker() {
        let pool = Arc::new(pool(1));

        let inner = Arc::clone(&pool);
        let handle = pool.submit(move || inner.shutdown()).unwrap();

        assert_eq!(handle.get(), Ok(()));
        assert!(pool.is_stopped());
    }

    #[test]
    fn test_concurrent_shutdown_from_worker() {
        let pool = Arc::new(pool(2));

        let inner = Arc::clone(&pool);
        let handle = pool
            .submit(move || {
                thread::sleep(Duration::from_millis(20));
                inner.shutdown();
            })
            .unwrap();

        // joins the worker above while it shuts the pool down as well
        pool.shutdown();

        assert_eq!(handle.get(), Ok(()));
        assert!(pool.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_await_handles() {
        let pool = pool(3);

        let handles = (0..10u64).map(|i| pool.submit(move || i + 1).unwrap());

        let results = futures::future::join_all(handles).await;

        assert_eq!(results.into_iter().map(Result::unwrap).sum::<u64>(), 55);
    }
}
