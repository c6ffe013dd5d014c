use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::task::{self, Pool};

use super::*;

const DEFAULT_CAPACITY: usize = 64;

/// A loaded resource and the number of its outstanding holders.
#[derive(Debug)]
struct ResourceEntry {
    payload: Bytes,
    /// Never 0: the entry is removed as soon as the last holder releases it.
    refcount: usize,
    /// Distinguishes successive lifecycles of the same name.
    generation: u64,
}

/// Resource slot state.
#[derive(Debug)]
enum Slot {
    /// A first-time read is in progress on behalf of some caller.
    ///
    /// Other callers wait for the slot to settle instead of reading the store a second time. This state is never
    /// reported as loaded.
    Loading,
    /// Loaded state, held by at least one caller.
    Ready(ResourceEntry),
}

/// Reference-counted resource cache.
///
/// Resources are named byte blobs read once from a [`BackingStore`] and shared by every caller holding them. Each
/// [`ResourceCache::load_resource()`] must be paired with one [`ResourceCache::unload_resource()`]; the resource is
/// evicted when the last holder releases it. [`ResourceCache::acquire()`] returns a [`ResourceRef`] guard doing the
/// pairing on drop.
///
/// Blocking reads run on the cache's own [`Pool`] unless the cache was created [`synchronous`](Self::synchronous),
/// in which case they run on the calling thread.
///
/// # Example
/// ```no_run
/// # use resources::cache::ResourceCache;
/// let cache = ResourceCache::new("assets/");
///
/// cache.load_resource("tex", "textures/tex.png")?;
/// let bytes = cache.get_resource("tex")?;
/// // ... upload bytes ...
/// cache.unload_resource("tex");
/// # Ok::<_, resources::cache::Error>(())
/// ```
#[derive(Debug)]
pub struct ResourceCache {
    /// The base path relative resource paths are resolved against.
    root: PathBuf,
    /// The store resources are read from.
    store: Arc<dyn BackingStore>,
    /// An in-memory `HashMap` protected for concurrent access, keyed by resource name.
    entries: Mutex<HashMap<String, Slot>>,
    /// Notified whenever a `Loading` slot settles.
    ///
    /// Shared by every name: woken waiters re-check their own slot and go back to sleep if it is still loading.
    settled: Condvar,
    /// Source of entry generations.
    generation: AtomicU64,
    /// A pool to offload blocking reads, if any.
    pool: Option<Pool>,
}

impl ResourceCache {
    /// Create a cache reading from the local storage under `root`, with as many background workers as the available
    /// hardware parallelism.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_pool(root.into(), Some(Pool::default()))
    }

    /// Create a cache reading from the local storage under `root`, with `workers` background workers.
    pub fn with_workers(root: impl Into<PathBuf>, workers: NonZeroUsize) -> Self {
        Self::with_pool(root.into(), Some(Pool::new(workers)))
    }

    /// Create a cache reading from the local storage under `root` directly on the calling threads.
    pub fn synchronous(root: impl Into<PathBuf>) -> Self {
        Self::with_pool(root.into(), None)
    }

    fn with_pool(root: PathBuf, pool: Option<Pool>) -> Self {
        Self {
            store: Arc::new(FsStore::new(root.clone())),
            root,
            entries: Mutex::new(HashMap::with_capacity(DEFAULT_CAPACITY)),
            settled: Condvar::new(),
            generation: AtomicU64::new(0),
            pool,
        }
    }

    /// Build the cache with another backing store, which is given paths relative to the root.
    #[inline]
    pub fn with_store(mut self, store: impl BackingStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// The base path resources are loaded from.
    #[inline]
    pub fn get_resource_path(&self) -> &Path {
        self.root.as_path()
    }

    /// Whether `name` can be read from the backing store, regardless of it being loaded.
    pub fn resource_exists(&self, name: &str) -> bool {
        self.store.exists(Path::new(name))
    }

    /// Whether `name` is currently held by at least one caller.
    pub fn resource_loaded(&self, name: &str) -> bool {
        matches!(self.entries.lock().unwrap().get(name), Some(Slot::Ready(_)))
    }

    /// Number of outstanding holders of `name`, 0 when not loaded.
    pub fn ref_count(&self, name: &str) -> usize {
        match self.entries.lock().unwrap().get(name) {
            Some(Slot::Ready(entry)) => entry.refcount,
            _ => 0,
        }
    }

    /// List resources that are currently loaded.
    pub fn list_resources(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(name, slot)| matches!(slot, Slot::Ready(_)).then(|| name.clone()))
            .collect()
    }

    /// Load `name` from `path`, or just take one more reference on it when already loaded.
    ///
    /// The backing store is read only when `name` is not loaded yet, even if the underlying data has changed since.
    /// Concurrent first-time loads of the same name perform a single read: one caller reads while the others wait
    /// for it, then take their own reference.
    ///
    /// # Errors
    /// [`Error::NotFound`] when the store cannot be read, in which case nothing is cached.
    pub fn load_resource(&self, name: &str, path: impl AsRef<Path>) -> Result<(), Error> {
        self.load(name, path.as_ref()).map(drop)
    }

    /// Load `name` from `path` and return a guard releasing it on drop.
    pub fn acquire(&self, name: &str, path: impl AsRef<Path>) -> Result<ResourceRef<'_>, Error> {
        let (payload, generation) = self.load(name, path.as_ref())?;

        Ok(ResourceRef {
            cache: self,
            name: name.to_owned(),
            payload,
            generation,
        })
    }

    /// Release one reference on `name`, evicting it when it was the last one.
    ///
    /// Releasing a resource that is not loaded is a no-op: surplus releases are clamped, the count never goes below
    /// zero. Returns whether a reference was actually released.
    pub fn unload_resource(&self, name: &str) -> bool {
        self.release(name, None)
    }

    /// Release one reference on `name`, only within its `generation` lifecycle when given.
    fn release(&self, name: &str, generation: Option<u64>) -> bool {
        let mut entries = self.entries.lock().unwrap();

        let entry = match entries.get_mut(name) {
            Some(Slot::Ready(entry)) if generation.map_or(true, |generation| generation == entry.generation) => entry,
            _ => return false,
        };

        entry.refcount -= 1;

        if entry.refcount == 0 {
            entries.remove(name);

            tracing::debug!("Evicted resource `{name}`");
        } else {
            tracing::trace!("Released resource `{name}`, {} refs left", entry.refcount);
        }

        true
    }

    /// Return a read-only view on the contents of `name`.
    ///
    /// Repeated calls return the same bytes as long as `name` is held.
    ///
    /// # Errors
    /// [`Error::NotLoaded`] when nobody holds `name`.
    pub fn get_resource(&self, name: &str) -> Result<Bytes, Error> {
        match self.entries.lock().unwrap().get(name) {
            Some(Slot::Ready(entry)) => Ok(entry.payload.clone()),
            _ => Err(Error::NotLoaded(name.to_owned())),
        }
    }

    fn load(&self, name: &str, path: &Path) -> Result<(Bytes, u64), Error> {
        let mut entries = self.entries.lock().unwrap();

        loop {
            match entries.get_mut(name) {
                Some(Slot::Ready(entry)) => {
                    entry.refcount += 1;

                    tracing::trace!("Acquired resource `{name}`, {} refs", entry.refcount);

                    return Ok((entry.payload.clone(), entry.generation));
                }
                Some(Slot::Loading) => {
                    tracing::trace!("Waiting for resource `{name}` to be loaded...");

                    entries = self.settled.wait(entries).unwrap();
                }
                None => break,
            }
        }

        entries.insert(name.to_owned(), Slot::Loading);
        drop(entries);

        tracing::debug!("Loading resource `{name}` from local storage: `{}`", self.root.join(path).display());

        // the lock is not held while reading, other names can be served in the meantime
        let result = match self.read(path) {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(source)) => Err(Error::NotFound {
                name: name.to_owned(),
                path: self.root.join(path),
                source,
            }),
            Err(err) => Err(Error::Task(err)),
        };

        let mut entries = self.entries.lock().unwrap();

        let result = match result {
            Ok(payload) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let entry = ResourceEntry {
                    payload: payload.clone(),
                    refcount: 1,
                    generation,
                };
                entries.insert(name.to_owned(), Slot::Ready(entry));

                Ok((payload, generation))
            }
            Err(err) => {
                entries.remove(name);

                tracing::debug!("Failed to load resource `{name}`: {err}");

                Err(err)
            }
        };

        drop(entries);
        self.settled.notify_all();

        result
    }

    fn read(&self, path: &Path) -> Result<io::Result<Bytes>, crate::task::Error> {
        match self.pool {
            Some(ref pool) => {
                let store = Arc::clone(&self.store);
                let path = path.to_owned();

                pool.submit(move || store.read(&path))?.get()
            }
            // a panicking store must not leave the `Loading` slot behind
            None => panic::catch_unwind(AssertUnwindSafe(|| self.store.read(path)))
                .map_err(|payload| task::Error::Panicked(task::panic_message(payload))),
        }
    }

    /// Take one more reference on `name`, as long as it is still in its `generation` lifecycle.
    fn retain(&self, name: &str, generation: u64) {
        match self.entries.lock().unwrap().get_mut(name) {
            Some(Slot::Ready(entry)) if entry.generation == generation => entry.refcount += 1,
            _ => tracing::trace!("Resource `{name}` was released from under its reference"),
        }
    }

}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(PoisonError::into_inner);

        if !entries.is_empty() {
            tracing::debug!("Releasing {} resources still held from `{}`", entries.len(), self.root.display());
        }

        entries.clear();

        // the pool is dropped next, draining any pending read
    }
}

/// Resource reference.
///
/// The resource remains loaded until this reference, and every clone of it, is dropped.
#[derive(Debug)]
pub struct ResourceRef<'a> {
    cache: &'a ResourceCache,
    name: String,
    payload: Bytes,
    generation: u64,
}

impl ResourceRef<'_> {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A cheap handle on the contents, which may outlive this reference.
    #[inline]
    pub fn bytes(&self) -> Bytes {
        self.payload.clone()
    }
}

impl Deref for ResourceRef<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.payload
    }
}

impl Clone for ResourceRef<'_> {
    fn clone(&self) -> Self {
        self.cache.retain(&self.name, self.generation);

        Self {
            cache: self.cache,
            name: self.name.clone(),
            payload: self.payload.clone(),
            generation: self.generation,
        }
    }
}

impl Drop for ResourceRef<'_> {
    fn drop(&mut self) {
        self.cache.release(&self.name, Some(self.generation));
    }
}
