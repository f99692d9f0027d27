//! HTTP server for the webhook daemon.
//!
//! This module ties the pieces together:
//! - [`router::PathRouter`] - longest-prefix routing of request paths to
//!   registered targets (hook chains and the status page)
//! - [`dispatch`] - the request pipeline: authorization, body collection,
//!   JSON parsing, hook-chain iteration
//! - [`serve`] - the accept loop with connection limits, optional TLS,
//!   and the inactivity timeout
//! - [`status`] - the HTML status page
//!
//! # Endpoints
//!
//! - `POST <hook.uri_path>` - GitLab webhook deliveries
//! - `GET /status` - counters as an HTML page

use std::sync::Arc;

pub mod dispatch;
pub mod router;
pub mod serve;
pub mod status;
pub mod tls;

pub use router::{PathRouter, RouteError};
pub use serve::{BindError, HttpServer};

use crate::hooks::HookChain;
use crate::queue::ActionQueue;
use crate::stats::Stats;

/// Path the status page is served on.
pub const STATUS_PATH: &str = "/status";

/// What a routed path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// The HTML status page.
    Status,

    /// Index into the chain list.
    Chain(usize),
}

/// Shared application state, passed to the dispatcher via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    router: PathRouter<RouteTarget>,
    chains: Vec<HookChain>,
    queue: ActionQueue,
    stats: Arc<Stats>,
    content_size_limit: usize,
}

impl AppState {
    /// Builds the state and the path routing table.
    ///
    /// Registration fails if a hook path collides with the status page or
    /// another registration (chains already group duplicates, so this
    /// guards against normalization collisions like `/x` vs `/x/`).
    pub fn new(
        chains: Vec<HookChain>,
        queue: ActionQueue,
        stats: Arc<Stats>,
        content_size_limit: usize,
    ) -> Result<Self, RouteError> {
        let mut router = PathRouter::new();
        router.add_handler(STATUS_PATH, RouteTarget::Status)?;
        for (index, chain) in chains.iter().enumerate() {
            router.add_handler(chain.uri_path(), RouteTarget::Chain(index))?;
        }

        Ok(AppState {
            inner: Arc::new(AppStateInner {
                router,
                chains,
                queue,
                stats,
                content_size_limit,
            }),
        })
    }

    /// The path routing table.
    pub fn router(&self) -> &PathRouter<RouteTarget> {
        &self.inner.router
    }

    /// All hook chains; `RouteTarget::Chain` indexes into this.
    pub fn chains(&self) -> &[HookChain] {
        &self.inner.chains
    }

    /// The action queue accepted hooks append to.
    pub fn queue(&self) -> &ActionQueue {
        &self.inner.queue
    }

    /// The shared counters.
    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    /// Largest accepted request body, in bytes.
    pub fn content_size_limit(&self) -> usize {
        self.inner.content_size_limit
    }
}

/// Builds the axum app around the dispatcher.
///
/// Every request goes through [`dispatch::dispatch`]; path routing happens
/// against the [`PathRouter`], not axum's own route table, to get the
/// longest-prefix fallback semantics.
pub fn build_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .fallback(dispatch::dispatch)
        .with_state(state)
}
