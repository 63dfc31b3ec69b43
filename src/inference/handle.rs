//! Single-owner cell around a native model handle.
//!
//! The handle lives in an `RwLock<Option<RawModel>>`. Every native call runs
//! under a read guard, so calls (including a long-running prompt on a worker
//! thread) proceed concurrently with each other but never with teardown.
//! `release` takes the write lock, which waits for all readers to drain,
//! then destroys the handle if it is still there. Later callers find `None`
//! and fail with [`Error::NotLoaded`] without reaching the engine.
//!
//! Once teardown has started, new callers are turned away immediately rather
//! than queueing behind the pending writer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::inference::native::{NativeEngine, RawModel};

pub struct HandleOwner {
    engine: Arc<dyn NativeEngine>,
    slot: RwLock<Option<RawModel>>,
    releasing: AtomicBool,
}

impl HandleOwner {
    /// Create a handle through the engine's factory and take ownership of it.
    ///
    /// A factory error is returned as [`Error::LoadFailure`] with the native
    /// record intact; nothing is owned in that case.
    pub fn acquire(engine: Arc<dyn NativeEngine>, model_path: &Path, build_variant: &str) -> Result<Self> {
        let raw = engine
            .create(model_path, build_variant)
            .map_err(Error::LoadFailure)?;

        debug!(handle = raw.addr(), path = %model_path.display(), build_variant, "Acquired model handle");

        Ok(Self {
            engine,
            slot: RwLock::new(Some(raw)),
            releasing: AtomicBool::new(false),
        })
    }

    /// Whether the handle is usable: not released and no release pending.
    pub fn is_live(&self) -> bool {
        if self.releasing.load(Ordering::Acquire) {
            return false;
        }
        // Only `release` writes, so a failed try_read means teardown is underway.
        self.slot.try_read().is_some_and(|slot| slot.is_some())
    }

    /// Run `f` against the live handle.
    ///
    /// Teardown is held off until `f` returns. `f` must not call back into
    /// this owner.
    pub fn with_handle<T>(&self, f: impl FnOnce(&dyn NativeEngine, RawModel) -> Result<T>) -> Result<T> {
        if self.releasing.load(Ordering::Acquire) {
            return Err(Error::NotLoaded);
        }
        let guard = self.slot.try_read().ok_or(Error::NotLoaded)?;
        let raw = (*guard).ok_or(Error::NotLoaded)?;
        f(self.engine.as_ref(), raw)
    }

    /// Destroy the handle. Returns `true` only for the call that actually
    /// tore it down; concurrent and repeated calls return `false`.
    ///
    /// Blocks until in-flight native calls on this handle have returned.
    /// Calls arriving meanwhile fail with [`Error::NotLoaded`].
    pub fn release(&self) -> bool {
        self.releasing.store(true, Ordering::Release);
        let mut slot = self.slot.write();
        match slot.take() {
            Some(raw) => {
                debug!(handle = raw.addr(), "Destroying model handle");
                self.engine.destroy(raw);
                true
            }
            None => false,
        }
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }
}

impl Drop for HandleOwner {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for HandleOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleOwner")
            .field("live", &self.is_live())
            .finish()
    }
}
