//! A blacklist of failed routes.

use std::collections::HashSet;

use parking_lot::Mutex;

use super::Route;

/// Routes which recently failed, shared by every call made through one client.
///
/// Route selection avoids these routes when other options are available, but still
/// tries them last. Every operation is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure connecting to `route`.
    pub fn failed(&self, route: &Route) {
        if self.failed.lock().insert(route.clone()) {
            tracing::trace!(%route, "route failed");
        }
    }

    /// Record a success connecting to `route`.
    pub fn connected(&self, route: &Route) {
        if self.failed.lock().remove(route) {
            tracing::trace!(%route, "route recovered");
        }
    }

    /// Returns `true` if `route` has failed recently and should be avoided.
    pub fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().contains(route)
    }

    /// Number of routes currently postponed.
    pub fn len(&self) -> usize {
        self.failed.lock().len()
    }

    /// Returns `true` if no routes are postponed.
    pub fn is_empty(&self) -> bool {
        self.failed.lock().is_empty()
    }
}
