//! Tunnel handle registry
//!
//! Maps small non-negative integers to live tunnels. A new tunnel always
//! gets the smallest value not currently in use, so handles are reused as
//! soon as they are freed:
//!
//! ```text
//!  start A -> 0     {0:A}
//!  start B -> 1     {0:A, 1:B}
//!  stop  A          {1:B}
//!  start C -> 0     {0:C, 1:B}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Identifier of a live tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(i32);

impl Handle {
    /// Value returned across the boundary when no handle exists
    pub const INVALID: i32 = -1;

    /// `None` for negative values
    pub fn new(value: i32) -> Option<Self> {
        (value >= 0).then_some(Self(value))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry errors
#[derive(thiserror::Error)]
pub enum RegistryError<T> {
    /// Every handle below the limit is taken. The instance is handed back.
    #[error("all {limit} tunnel handles in use")]
    Exhausted { instance: T, limit: i32 },
}

impl<T> RegistryError<T> {
    pub fn into_instance(self) -> T {
        match self {
            RegistryError::Exhausted { instance, .. } => instance,
        }
    }
}

impl<T> fmt::Debug for RegistryError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Exhausted { limit, .. } => {
                f.debug_struct("Exhausted").field("limit", limit).finish_non_exhaustive()
            }
        }
    }
}

/// Handle to instance map behind a single mutex.
///
/// The registry owns membership only. Callers tear instances down after
/// taking them out with [`Registry::remove`].
pub struct Registry<T> {
    slots: Mutex<BTreeMap<Handle, T>>,
    limit: i32,
}

impl<T> Registry<T> {
    /// Registry handing out values in `0..limit`
    pub fn new(limit: i32) -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            limit: limit.max(0),
        }
    }

    /// Store `instance` under the smallest free handle.
    pub fn allocate(&self, instance: T) -> Result<Handle, RegistryError<T>> {
        let mut slots = self.lock();

        let mut candidate: i32 = 0;
        for handle in slots.keys() {
            if handle.0 != candidate {
                break;
            }
            candidate += 1;
        }

        if candidate >= self.limit {
            return Err(RegistryError::Exhausted {
                instance,
                limit: self.limit,
            });
        }

        let handle = Handle(candidate);
        slots.insert(handle, instance);
        Ok(handle)
    }

    /// Run `f` on the instance under `handle` while holding the lock.
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().get(&handle).map(f)
    }

    pub fn remove(&self, handle: Handle) -> Option<T> {
        self.lock().remove(&handle)
    }

    /// Live handles in ascending order
    pub fn handles(&self) -> Vec<Handle> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Handle, T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Registry<T> {
    pub fn lookup(&self, handle: Handle) -> Option<T> {
        self.with(handle, T::clone)
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("handles", &self.handles())
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn h(value: i32) -> Handle {
        Handle::new(value).unwrap()
    }

    #[test]
    fn test_handle_rejects_negative() {
        assert!(Handle::new(-1).is_none());
        assert!(Handle::new(i32::MIN).is_none());
        assert_eq!(Handle::new(0).unwrap().get(), 0);
    }

    #[test]
    fn test_allocate_sequential() {
        let registry = Registry::new(i32::MAX);

        assert_eq!(registry.allocate("a").unwrap(), h(0));
        assert_eq!(registry.allocate("b").unwrap(), h(1));
        assert_eq!(registry.allocate("c").unwrap(), h(2));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_smallest_free_reused() {
        let registry = Registry::new(i32::MAX);
        for name in ["a", "b", "c", "d"] {
            registry.allocate(name).unwrap();
        }

        assert_eq!(registry.remove(h(2)), Some("c"));
        assert_eq!(registry.remove(h(0)), Some("a"));

        assert_eq!(registry.allocate("e").unwrap(), h(0));
        assert_eq!(registry.allocate("f").unwrap(), h(2));
        assert_eq!(registry.allocate("g").unwrap(), h(4));
        assert_eq!(registry.lookup(h(1)), Some("b"));
    }

    #[test]
    fn test_churn_always_picks_smallest_gap() {
        let registry = Registry::new(64);
        let mut live = std::collections::BTreeSet::new();

        // Deterministic pseudo-random start/stop sequence
        let mut state: u32 = 0x2545_f491;
        for _ in 0..2000 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;

            if state % 3 == 0 && !live.is_empty() {
                let victim = *live.iter().nth(state as usize % live.len()).unwrap();
                registry.remove(h(victim)).unwrap();
                live.remove(&victim);
            } else if live.len() < 64 {
                let expected = (0..).find(|v| !live.contains(v)).unwrap();
                let handle = registry.allocate(()).unwrap();
                assert_eq!(handle.get(), expected);
                live.insert(expected);
            }
        }

        let handles: Vec<i32> = registry.handles().into_iter().map(Handle::get).collect();
        assert_eq!(handles, live.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_exhausted_returns_instance() {
        let registry = Registry::new(2);
        registry.allocate("a").unwrap();
        registry.allocate("b").unwrap();

        let err = registry.allocate("c").unwrap_err();
        assert!(err.to_string().contains("2"));
        assert_eq!(err.into_instance(), "c");

        registry.remove(h(1));
        assert_eq!(registry.allocate("d").unwrap(), h(1));
    }

    #[test]
    fn test_unknown_handle() {
        let registry: Registry<&str> = Registry::new(8);

        assert!(registry.lookup(h(3)).is_none());
        assert!(registry.remove(h(3)).is_none());
        assert!(registry.with(h(3), |_| ()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let registry = Arc::new(Registry::new(i32::MAX));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..50)
                        .map(|_| registry.allocate(()).unwrap().get())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<i32> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        all.sort_unstable();

        assert_eq!(all, (0..400).collect::<Vec<_>>());
    }
}
