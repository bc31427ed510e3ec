use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Name-keyed mutual exclusion for operations on one container.
///
/// A name is present in the table only while some guard holds it. Claims
/// never block: the worker pool leaves a unit queued while its name is held
/// and retries once the holder's guard drops.
#[derive(Clone, Default)]
pub struct NameLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` if nobody holds it. The claim lasts until the guard drops.
    pub fn try_acquire(&self, name: &str) -> Option<NameGuard> {
        let mut set = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(name.to_owned()) {
            return None;
        }
        Some(NameGuard {
            locks: self.clone(),
            name: name.to_owned(),
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    pub fn held_count(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct NameGuard {
    locks: NameLocks,
    name: String,
}

impl NameGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First signal runs `on_shutdown`; a second one exits immediately.
pub fn install_signal_handler<F>(on_shutdown: F)
where
    F: Fn() + Send + 'static,
{
    let result = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            std::process::exit(1);
        }
        eprintln!("\nshutdown requested, draining in-flight operations...");
        on_shutdown();
    });
    if let Err(e) = result {
        warn!("failed to install signal handler: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
