//! Lazily built value published to concurrent readers.
//!
//! Readers take a snapshot of the current `Arc` without touching the build
//! lock. Builders serialize on the build lock, re-check under it, and only
//! publish fully constructed values.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::Result;

/// Outcome of [`PublishedHandle::get_or_build`].
pub enum Resolved<T: ?Sized, X> {
    /// A value was already published.
    Existing(Arc<T>),
    /// This caller built and published the value.
    Built(Arc<T>, X),
}

/// Atomically published, lazily built value.
pub struct PublishedHandle<T: ?Sized> {
    current: RwLock<Option<Arc<T>>>,
    build_lock: Mutex<()>,
}

impl<T: ?Sized> Default for PublishedHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> PublishedHandle<T> {
    /// Empty handle.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            build_lock: Mutex::new(()),
        }
    }

    /// Currently published value.
    pub fn current(&self) -> Option<Arc<T>> {
        self.current.read().clone()
    }

    /// Returns the published value, building it under the build lock if
    /// none exists yet. At most one concurrent caller runs `build`.
    pub fn get_or_build<X, F>(&self, build: F) -> Result<Resolved<T, X>>
    where
        F: FnOnce() -> Result<(Arc<T>, X)>,
    {
        if let Some(existing) = self.current() {
            return Ok(Resolved::Existing(existing));
        }
        let _guard = self.build_lock.lock();
        if let Some(existing) = self.current() {
            return Ok(Resolved::Existing(existing));
        }
        let (value, extra) = build()?;
        *self.current.write() = Some(Arc::clone(&value));
        Ok(Resolved::Built(value, extra))
    }

    /// Builds a replacement under the build lock and publishes it.
    pub fn replace_with<X, F>(&self, build: F) -> Result<(Arc<T>, X)>
    where
        F: FnOnce() -> Result<(Arc<T>, X)>,
    {
        let _guard = self.build_lock.lock();
        let (value, extra) = build()?;
        *self.current.write() = Some(Arc::clone(&value));
        Ok((value, extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn concurrent_callers_build_once() {
        let handle: Arc<PublishedHandle<String>> = Arc::new(PublishedHandle::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let handle = Arc::clone(&handle);
                let builds = Arc::clone(&builds);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let resolved = handle
                        .get_or_build(|| {
                            builds.fetch_add(1, Ordering::SeqCst);
                            Ok((Arc::new("plan".to_owned()), ()))
                        })
                        .expect("build");
                    match resolved {
                        Resolved::Existing(value) | Resolved::Built(value, ()) => value,
                    }
                })
            })
            .collect();
        let values: Vec<_> = workers
            .into_iter()
            .map(|worker| worker.join().expect("join"))
            .collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|value| Arc::ptr_eq(value, &values[0])));
    }

    #[test]
    fn failed_build_publishes_nothing() {
        let handle: PublishedHandle<u32> = PublishedHandle::new();
        let result = handle.get_or_build::<(), _>(|| {
            Err(crate::types::PlanError::invariant("translation failed"))
        });
        assert!(result.is_err());
        assert!(handle.current().is_none());
    }

    #[test]
    fn replacement_is_visible_to_later_readers() {
        let handle: PublishedHandle<u32> = PublishedHandle::new();
        let (first, _) = handle.replace_with(|| Ok((Arc::new(1), ()))).expect("first");
        let (second, _) = handle.replace_with(|| Ok((Arc::new(2), ()))).expect("second");
        let current = handle.current().expect("published");
        assert!(!Arc::ptr_eq(&first, &current));
        assert!(Arc::ptr_eq(&second, &current));
    }
}
