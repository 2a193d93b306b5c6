//! Route catalog used to report path templates instead of raw paths.
//!
//! Templates use `{param}` for single segments and `{*rest}` for catch-all
//! tails, and are matched with a radix tree (matchit).
//!
//! # Example
//!
//! ```rust
//! use apitally_serverless::Routes;
//! use http::Method;
//!
//! let routes = Routes::new()
//!     .route("/health", [Method::GET])
//!     .nest(
//!         "/api/v1",
//!         Routes::new()
//!             .route("/users", [Method::GET, Method::POST])
//!             .route("/users/{id}", [Method::GET]),
//!     );
//!
//! assert_eq!(
//!     routes.resolve(&Method::GET, "/api/v1/users/42").as_deref(),
//!     Some("/api/v1/users/{id}")
//! );
//! assert_eq!(routes.resolve(&Method::DELETE, "/api/v1/users/42"), None);
//! ```

use apitally_core::Endpoint;
use http::Method;
use matchit::Router as MatchitRouter;
use std::collections::HashMap;

/// Registered routes of the wrapped application
#[derive(Default)]
pub struct Routes {
    matcher: MatchitRouter<usize>,
    entries: Vec<RouteEntry>,
    /// Entry index by matchit path, for merging repeated registrations
    index: HashMap<String, usize>,
    mounts: Vec<Mount>,
}

struct RouteEntry {
    template: String,
    methods: Vec<Method>,
}

struct Mount {
    prefix: String,
    routes: Routes,
}

impl Routes {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path template for a set of methods.
    ///
    /// Registering the same template again adds to its methods. A template
    /// that conflicts with an existing one is skipped.
    pub fn route<I>(mut self, path: &str, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        let matchit_path = convert_path_params(path);

        if let Some(&existing) = self.index.get(&matchit_path) {
            let entry = &mut self.entries[existing];
            for method in methods {
                if !entry.methods.contains(&method) {
                    entry.methods.push(method);
                }
            }
            return self;
        }

        let position = self.entries.len();
        match self.matcher.insert(matchit_path.clone(), position) {
            Ok(()) => {
                let mut entry = RouteEntry {
                    template: path.to_string(),
                    methods: Vec::new(),
                };
                for method in methods {
                    if !entry.methods.contains(&method) {
                        entry.methods.push(method);
                    }
                }
                self.entries.push(entry);
                self.index.insert(matchit_path, position);
            }
            Err(error) => {
                tracing::warn!(path = %path, error = %error, "Skipping conflicting route");
            }
        }
        self
    }

    /// Mount another catalog under a prefix.
    pub fn nest(mut self, prefix: &str, routes: Routes) -> Self {
        self.mounts.push(Mount {
            prefix: normalize_prefix(prefix),
            routes,
        });
        self
    }

    /// Find the template matching a live request.
    ///
    /// Own routes are checked before mounts, and mounts in the order they
    /// were added. `HEAD` requests also match `GET` routes.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<String> {
        if let Ok(matched) = self.matcher.at(path) {
            let entry = &self.entries[*matched.value];
            if entry.allows(method) {
                return Some(entry.template.clone());
            }
        }

        self.mounts.iter().find_map(|mount| {
            let rest = strip_prefix(path, &mount.prefix)?;
            let template = mount.routes.resolve(method, rest)?;
            Some(join_prefix(&mount.prefix, &template))
        })
    }

    /// List every registered method and template, mounts included.
    ///
    /// `HEAD` is left out.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        self.collect_endpoints("/", &mut endpoints);
        endpoints
    }

    fn collect_endpoints(&self, prefix: &str, endpoints: &mut Vec<Endpoint>) {
        for entry in &self.entries {
            let path = join_prefix(prefix, &entry.template);
            for method in entry.methods.iter().filter(|m| **m != Method::HEAD) {
                endpoints.push(Endpoint::new(method.as_str(), path.clone()));
            }
        }
        for mount in &self.mounts {
            let nested_prefix = join_prefix(prefix, &mount.prefix);
            mount.routes.collect_endpoints(&nested_prefix, endpoints);
        }
    }

    /// Whether nothing was registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.mounts.iter().all(|mount| mount.routes.is_empty())
    }
}

impl std::fmt::Debug for Routes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.endpoints()).finish()
    }
}

impl RouteEntry {
    fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method) || (*method == Method::HEAD && self.methods.contains(&Method::GET))
    }
}

/// Convert `{param}` to `:param` and `{*rest}` to `*rest` for matchit
fn convert_path_params(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if chars.peek() != Some(&'*') {
                    result.push(':');
                }
            }
            '}' => {}
            _ => result.push(ch),
        }
    }

    result
}

/// Normalize a mount prefix to a single leading slash and no trailing one
fn normalize_prefix(prefix: &str) -> String {
    let segments: Vec<&str> = prefix.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_string();
    }

    let mut result = String::with_capacity(prefix.len() + 1);
    for segment in segments {
        result.push('/');
        result.push_str(segment);
    }
    result
}

/// Path below a normalized prefix, only on segment boundaries
fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(path);
    }
    match path.strip_prefix(prefix)? {
        "" => Some("/"),
        rest if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

fn join_prefix(prefix: &str, template: &str) -> String {
    match (prefix, template) {
        ("/", template) => template.to_string(),
        (prefix, "/") => prefix.to_string(),
        (prefix, template) => format!("{prefix}{template}"),
    }
}
