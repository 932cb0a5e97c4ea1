//! Route registry: map `(method, path)` pairs to opaque handler identifiers.
//!
//! The registry knows nothing about handler logic. It hands out a fresh
//! [`HandlerId`] for every registration and answers lookups with exact string
//! comparison on both method and path:
//!
//! | Registered            | Lookup               | Result     |
//! |-----------------------|----------------------|------------|
//! | `GET /health`         | `GET /health`        | id         |
//! | `GET /health`         | `GET /health/`       | not found  |
//! | `GET /x`              | `POST /x`            | not found  |
//! | `GET /a` twice        | `GET /a`             | second id  |
//!
//! There is no unregister. Registering the same pair again shadows the
//! earlier entry; the earlier id stays valid but is no longer resolved.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;

use parking_lot::RwLock;

/// Identifier of one route registration.
///
/// Ids start at 1 and strictly increase. Zero is not representable, so "no
/// route matched" is expressed as `Option::None` rather than a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(NonZeroU64);

impl HandlerId {
    /// Wraps a raw id; returns `None` for the reserved value 0.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct Table {
    issued: u64,
    // method -> path -> most recent id
    routes: HashMap<String, HashMap<String, HandlerId>>,
}

/// Thread-safe route table.
///
/// `register` takes the write lock for the whole allocate-and-publish step,
/// so a concurrent `resolve` sees either no entry or the complete one.
///
/// # Examples
///
/// ```
/// use cavebridge::router::RouteRegistry;
///
/// let registry = RouteRegistry::new();
/// let health = registry.register("GET", "/health");
/// assert_eq!(health.get(), 1);
/// assert_eq!(registry.resolve("GET", "/health"), Some(health));
/// assert_eq!(registry.resolve("POST", "/health"), None);
/// ```
#[derive(Default)]
pub struct RouteRegistry {
    table: RwLock<Table>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a route and returns its freshly allocated id.
    pub fn register(&self, method: &str, path: &str) -> HandlerId {
        let mut table = self.table.write();
        let id = HandlerId(NonZeroU64::MIN.saturating_add(table.issued));
        table.issued += 1;
        table
            .routes
            .entry(method.to_owned())
            .or_default()
            .insert(path.to_owned(), id);
        tracing::debug!(%method, %path, handler = %id, "route registered");
        id
    }

    /// Returns the id of the most recent registration for exactly `method` and `path`.
    pub fn resolve(&self, method: &str, path: &str) -> Option<HandlerId> {
        self.table.read().routes.get(method)?.get(path).copied()
    }

    /// Number of registrations issued, shadowed ones included.
    pub fn len(&self) -> usize {
        usize::try_from(self.table.read().issued).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().issued == 0
    }
}

impl fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        f.debug_struct("RouteRegistry")
            .field("issued", &table.issued)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn handler_id_rejects_zero() {
        assert!(HandlerId::new(0).is_none());
        assert_eq!(HandlerId::new(3).map(HandlerId::get), Some(3));
    }

    #[test]
    fn starts_empty() {
        let registry = RouteRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.resolve("GET", "/"), None);
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let registry = RouteRegistry::new();
        let ids: Vec<u64> = ["/a", "/b", "/c"]
            .iter()
            .map(|p| registry.register("GET", p).get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn health_scenario() {
        let registry = RouteRegistry::new();
        let id = registry.register("GET", "/health");
        assert_eq!(id.get(), 1);
        assert_eq!(registry.resolve("GET", "/health"), Some(id));
    }

    #[test]
    fn method_must_match() {
        let registry = RouteRegistry::new();
        registry.register("GET", "/x");
        assert_eq!(registry.resolve("POST", "/x"), None);
    }

    #[test]
    fn no_normalization() {
        let registry = RouteRegistry::new();
        registry.register("GET", "/users");
        assert_eq!(registry.resolve("GET", "/users/"), None);
        assert_eq!(registry.resolve("get", "/users"), None);
        assert_eq!(registry.resolve("GET", "/Users"), None);
    }

    #[test]
    fn duplicate_registration_shadows() {
        let registry = RouteRegistry::new();
        let first = registry.register("GET", "/dup");
        let second = registry.register("GET", "/dup");
        assert!(second > first);
        assert_eq!(registry.resolve("GET", "/dup"), Some(second));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn concurrent_registrations_never_collide() {
        let registry = Arc::new(RouteRegistry::new());
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..100)
                        .map(|i| registry.register("GET", &format!("/w{worker}/{i}")).get())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(all.first(), Some(&1));
        assert_eq!(all.last(), Some(&800));
        assert!(registry.resolve("GET", "/w3/42").is_some());
    }

    #[test]
    fn resolve_during_registration_sees_complete_entries() {
        let registry = Arc::new(RouteRegistry::new());
        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..500 {
                    registry.register("GET", &format!("/r{i}"));
                }
            })
        };
        for _ in 0..500 {
            if let Some(id) = registry.resolve("GET", "/r0") {
                assert_eq!(id.get(), 1);
            }
        }
        writer.join().unwrap();
        assert_eq!(registry.resolve("GET", "/r499").map(HandlerId::get), Some(500));
    }
}
