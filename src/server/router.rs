//! Longest-prefix path routing.
//!
//! Handlers are registered under normalized paths; lookup walks the request
//! path upwards segment by segment until a registered path matches, so
//! `/a/b/c` falls back to `/a/b`, then `/a`, then `/`. This mirrors how a
//! hook registered on `/deploy` still owns `/deploy/anything` (and can then
//! decide to reject it).

use thiserror::Error;

/// Errors registering a handler path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Paths are absolute; anything else is a configuration defect.
    #[error("handler path '{0}' must start with '/'")]
    NotAbsolute(String),

    /// Two handlers on one path would shadow each other.
    #[error("duplicate handler path '{0}'")]
    Duplicate(String),
}

/// A set of path-addressed handlers with longest-prefix lookup.
#[derive(Debug, Default)]
pub struct PathRouter<T> {
    routes: Vec<(String, T)>,
}

impl<T> PathRouter<T> {
    /// Creates an empty router.
    pub fn new() -> Self {
        PathRouter { routes: Vec::new() }
    }

    /// Registers `handler` under `path`.
    ///
    /// The path must start with `/`; a trailing slash (except on the root
    /// itself) is stripped, so `/deploy/` and `/deploy` are the same
    /// registration. Duplicates are rejected.
    pub fn add_handler(&mut self, path: &str, handler: T) -> Result<(), RouteError> {
        let normalized = normalize(path)?;
        if self
            .routes
            .iter()
            .any(|(existing, _)| *existing == normalized)
        {
            return Err(RouteError::Duplicate(normalized));
        }
        self.routes.push((normalized, handler));
        Ok(())
    }

    /// Finds the handler whose registered path is the longest prefix of
    /// `path` (on segment boundaries).
    pub fn lookup(&self, path: &str) -> Option<&T> {
        let mut current = path;
        loop {
            if let Some(handler) = self.find(current) {
                return Some(handler);
            }
            if current == "/" {
                return None;
            }
            current = match current.rfind('/') {
                Some(0) | None => "/",
                Some(index) => &current[..index],
            };
        }
    }

    fn find(&self, path: &str) -> Option<&T> {
        self.routes
            .iter()
            .find(|(registered, _)| registered == path)
            .map(|(_, handler)| handler)
    }
}

/// Validates and canonicalizes a registration path.
fn normalize(path: &str) -> Result<String, RouteError> {
    if !path.starts_with('/') {
        return Err(RouteError::NotAbsolute(path.to_string()));
    }
    let stripped = path.strip_suffix('/').filter(|s| !s.is_empty());
    Ok(stripped.unwrap_or(path).to_string())
}
