use crate::config::RouteConfig;
use crate::error::{AppError, Result};
use http::Method;
use matchit::Router as MatchitRouter;
use std::collections::HashMap;

/// Route information
#[derive(Debug, Clone)]
pub struct Route {
    /// Backend service URL
    pub backend: String,
    /// Allowed HTTP methods (empty means all methods allowed)
    pub methods: Vec<Method>,
    /// Whether to strip the static prefix when forwarding
    pub strip_prefix: bool,
    /// Pattern text before the first parameter, removed when `strip_prefix` is set
    pub prefix: String,
    /// Route description
    pub description: String,
}

/// Matches request paths to proxied backends.
///
/// A path no route claims is not an error: the host falls through to the static
/// file stage, which is where redirect targets usually live.
#[derive(Debug, Clone)]
pub struct Router {
    matcher: MatchitRouter<Route>,
    patterns: Vec<String>,
}

impl Router {
    /// Create a new router from route configurations
    pub fn new(routes: Vec<RouteConfig>) -> Result<Self> {
        let mut matcher = MatchitRouter::new();
        let mut patterns = Vec::with_capacity(routes.len());

        for route_config in routes {
            let methods = route_config
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_uppercase().as_bytes())
                        .map_err(|_| AppError::InvalidMethod(m.clone()))
                })
                .collect::<Result<Vec<_>>>()?;

            let route = Route {
                backend: route_config.backend,
                methods,
                strip_prefix: route_config.strip_prefix,
                prefix: static_prefix(&route_config.path),
                description: route_config.description,
            };

            let matchit_path = convert_path_syntax(&route_config.path);

            matcher.insert(&matchit_path, route).map_err(|e| {
                AppError::InvalidRoute(format!(
                    "Failed to insert route '{}': {}",
                    route_config.path, e
                ))
            })?;
            patterns.push(route_config.path);
        }

        Ok(Self { matcher, patterns })
    }

    /// Match a request to a route.
    ///
    /// `Ok(None)` means no route claims the path. A claimed path with a method the
    /// route does not allow is an error.
    pub fn match_route(&self, path: &str, method: &Method) -> Result<Option<RouteMatch>> {
        let Ok(matched) = self.matcher.at(path) else {
            return Ok(None);
        };

        let route = matched.value;

        if !route.methods.is_empty() && !route.methods.contains(method) {
            return Err(AppError::InvalidMethod(format!(
                "Method {} not allowed for path {}",
                method, path
            )));
        }

        let params: HashMap<String, String> = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Ok(Some(RouteMatch {
            route: route.clone(),
            params,
        }))
    }

    /// Configured route patterns, in insertion order
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Result of matching a route
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The matched route
    pub route: Route,
    /// Path parameters extracted from the URL
    pub params: HashMap<String, String>,
}

impl RouteMatch {
    /// Backend URL for a request path and optional query
    pub fn build_backend_url(&self, original_path: &str, query: Option<&str>) -> String {
        let backend = self.route.backend.trim_end_matches('/');

        let path = if self.route.strip_prefix {
            match original_path.strip_prefix(self.route.prefix.trim_end_matches('/')) {
                Some(rest) if rest.is_empty() => "/",
                Some(rest) => rest,
                None => original_path,
            }
        } else {
            original_path
        };

        let mut url = format!("{}{}", backend, path);
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Convert path syntax from Express-style (:param, *path) to matchit syntax ({param}, {*path})
fn convert_path_syntax(path: &str) -> String {
    let mut result = String::with_capacity(path.len() + 4);
    let mut chars = path.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            ':' | '*' => {
                result.push('{');
                if ch == '*' {
                    result.push('*');
                }
                while let Some(name_ch) = chars.next_if(|c| c.is_alphanumeric() || *c == '_') {
                    result.push(name_ch);
                }
                result.push('}');
            }
            _ => result.push(ch),
        }
    }

    result
}

/// Pattern text up to the first parameter
fn static_prefix(path: &str) -> String {
    let end = path.find([':', '*']).unwrap_or(path.len());
    path[..end].to_string()
}
