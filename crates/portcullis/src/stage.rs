//! Stages: atomically published, immutable route tables.
//!
//! A stage is built completely before it becomes visible. Publishing swaps a
//! single `ArcSwapOption`, so a request holding the old snapshot keeps a
//! consistent view while new requests see the new one.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use portcullis_router::{RouteConflict, RouteEntry, RouteMatch, Router};
use thiserror::Error;

use crate::route::Route;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("conflicting route: {0}")]
    Conflict(#[from] RouteConflict),

    #[error("stage {0} not found")]
    NotFound(u64),

    #[error("stage {0} is active and cannot be retired")]
    Active(u64),
}

#[derive(Debug)]
pub struct Stage {
    pub version: u64,
    pub label: String,
    pub published_at: SystemTime,
    routes: Vec<Arc<Route>>,
    router: Router,
}

/// Result of matching a request against a stage.
pub enum StageMatch<'a> {
    Found {
        route: &'a Arc<Route>,
        params: BTreeMap<String, String>,
    },
    MethodNotAllowed(Vec<String>),
    NotFound,
}

impl Stage {
    /// Build a stage, rejecting any pair of routes with equal specificity.
    pub fn build(version: u64, label: impl Into<String>, routes: Vec<Route>) -> Result<Self, RouteConflict> {
        let mut router = Router::new();
        for (route_index, route) in routes.iter().enumerate() {
            router.insert(&route.path, &route.method, RouteEntry { route_index })?;
        }
        Ok(Self {
            version,
            label: label.into(),
            published_at: SystemTime::now(),
            routes: routes.into_iter().map(Arc::new).collect(),
            router,
        })
    }

    pub fn match_route(&self, method: &str, path: &str) -> StageMatch<'_> {
        match self.router.lookup(path, method) {
            RouteMatch::Found { entry, params } => match self.routes.get(entry.route_index) {
                Some(route) => StageMatch::Found {
                    route,
                    params: params.into_iter().collect(),
                },
                None => StageMatch::NotFound,
            },
            RouteMatch::MethodNotAllowed { allowed } => StageMatch::MethodNotAllowed(allowed),
            RouteMatch::NotFound => StageMatch::NotFound,
        }
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn route_ids(&self) -> HashSet<String> {
        self.routes.iter().map(|r| r.id()).collect()
    }
}

/// Outcome of a successful publish.
pub struct Publication {
    pub stage: Arc<Stage>,
    pub previous: Option<Arc<Stage>>,
}

pub struct StageRegistry {
    label: String,
    active: ArcSwapOption<Stage>,
    retained: RwLock<BTreeMap<u64, Arc<Stage>>>,
    /// Next version to hand out; held for the whole publish.
    next_version: Mutex<u64>,
}

impl StageRegistry {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            active: ArcSwapOption::empty(),
            retained: RwLock::new(BTreeMap::new()),
            next_version: Mutex::new(1),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Build and activate a new stage. On conflict nothing changes and no
    /// version number is consumed.
    pub fn publish(&self, routes: Vec<Route>) -> Result<Publication, StageError> {
        let mut next = self.next_version.lock();
        let stage = Arc::new(Stage::build(*next, self.label.clone(), routes)?);
        *next += 1;

        self.retained.write().insert(stage.version, Arc::clone(&stage));
        let previous = self.active.swap(Some(Arc::clone(&stage)));
        Ok(Publication { stage, previous })
    }

    pub fn active(&self) -> Option<Arc<Stage>> {
        self.active.load_full()
    }

    pub fn get(&self, version: u64) -> Option<Arc<Stage>> {
        self.retained.read().get(&version).cloned()
    }

    /// Drop a retained stage. The active stage cannot be retired.
    pub fn retire(&self, version: u64) -> Result<Arc<Stage>, StageError> {
        // Publishing takes this lock too, so the active stage cannot change underneath.
        let _publishing = self.next_version.lock();
        if self.active.load().as_ref().is_some_and(|s| s.version == version) {
            return Err(StageError::Active(version));
        }
        self.retained
            .write()
            .remove(&version)
            .ok_or(StageError::NotFound(version))
    }

    /// Retained stages in version order.
    pub fn list(&self) -> Vec<Arc<Stage>> {
        self.retained.read().values().cloned().collect()
    }
}
