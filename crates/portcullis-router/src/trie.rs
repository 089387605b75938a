use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

/// Method name that matches any request method at a node.
///
/// An explicit method registered on the same path always wins over it.
pub const ANY_METHOD: &str = "ANY";

/// The routing trie. Maps HTTP paths + methods to route matches.
#[derive(Debug, Default)]
pub struct Router {
    root: Node,
    len: usize,
}

/// A single node in the prefix trie.
#[derive(Debug, Default)]
struct Node {
    /// Literal children keyed by segment text.
    static_children: HashMap<String, Node>,
    /// Parameter child (at most one per node).
    param_child: Option<Box<ParamNode>>,
    /// Greedy tail child. Matches one or more remaining segments joined by `/`.
    /// Only valid at a terminal position (no further trie nodes after it).
    wildcard_child: Option<Box<ParamNode>>,
    /// Method-to-route mapping at this terminal node.
    methods: HashMap<String, RouteEntry>,
}

/// A named segment node (`{id}` or `{proxy+}`).
#[derive(Debug)]
struct ParamNode {
    /// Parameter name without braces or `+`.
    name: String,
    /// The subtree below this parameter.
    node: Node,
}

/// A matched route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// Index into the owning table's route list.
    pub route_index: usize,
}

/// The result of a route lookup.
#[derive(Debug)]
pub enum RouteMatch {
    /// Matched a path and method.
    Found {
        entry: RouteEntry,
        params: Vec<(String, String)>,
    },
    /// Path matched but method is not allowed.
    MethodNotAllowed { allowed: Vec<String> },
    /// No path matched.
    NotFound,
}

/// Rejected registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteConflict {
    #[error("route {method} {path} has the same specificity as an existing route")]
    Duplicate { method: String, path: String },

    #[error("parameter '{name}' in {path} collides with sibling parameter '{existing}'")]
    ParamName {
        path: String,
        name: String,
        existing: String,
    },

    #[error("invalid path template '{path}': {reason}")]
    InvalidTemplate { path: String, reason: String },
}

/// A parsed path segment.
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Param(String),
    /// Matches all remaining segments joined by `/`. Must be the last segment.
    Wildcard(String),
}

impl Router {
    /// Create a new empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered (method, path) pairs.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a route into the trie.
    ///
    /// Path should be a template like "/users/{id}/orders" or "/files/{key+}".
    /// Method is upper-cased; `ANY` registers a catch-all for the path.
    ///
    /// Two registrations that would resolve to the same trie node and method
    /// are rejected, as are sibling parameters with different names, since
    /// either would make the match result depend on registration order.
    pub fn insert(&mut self, path: &str, method: &str, entry: RouteEntry) -> Result<(), RouteConflict> {
        let segments = parse_path_template(path)?;
        let node = self.traverse_or_create(path, &segments)?;

        let method = method.to_uppercase();
        if node.methods.contains_key(&method) {
            return Err(RouteConflict::Duplicate {
                method,
                path: path.to_string(),
            });
        }
        node.methods.insert(method, entry);
        self.len += 1;
        Ok(())
    }

    /// Look up a request path and method.
    ///
    /// Path should be an actual request path (not a template).
    pub fn lookup(&self, path: &str, method: &str) -> RouteMatch {
        let normalized = normalize_path(path);
        let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();

        let method = method.to_uppercase();
        let mut params = Vec::new();
        let mut allowed = BTreeSet::new();
        match Self::traverse_and_match(&self.root, &segments, &method, &mut params, &mut allowed) {
            Some(entry) => RouteMatch::Found { entry: *entry, params },
            None if allowed.is_empty() => RouteMatch::NotFound,
            None => RouteMatch::MethodNotAllowed {
                allowed: allowed.into_iter().collect(),
            },
        }
    }

    /// Traverse or create nodes for a path template.
    fn traverse_or_create(&mut self, path: &str, segments: &[Segment]) -> Result<&mut Node, RouteConflict> {
        let mut current = &mut self.root;

        for segment in segments {
            current = match segment {
                Segment::Static(name) => current.static_children.entry(name.clone()).or_default(),
                Segment::Param(name) => {
                    let child = current.param_child.get_or_insert_with(|| {
                        Box::new(ParamNode {
                            name: name.clone(),
                            node: Node::default(),
                        })
                    });
                    check_param_name(path, name, &child.name)?;
                    &mut child.node
                }
                Segment::Wildcard(name) => {
                    let child = current.wildcard_child.get_or_insert_with(|| {
                        Box::new(ParamNode {
                            name: name.clone(),
                            node: Node::default(),
                        })
                    });
                    check_param_name(path, name, &child.name)?;
                    &mut child.node
                }
            };
        }

        Ok(current)
    }

    /// Traverse the trie matching actual path segments, capturing parameters.
    ///
    /// Returns the most specific route accepting `method`. Nodes that match
    /// the path under other methods add those methods to `allowed` and the
    /// walk backtracks to less specific siblings.
    fn traverse_and_match<'a>(
        node: &'a Node,
        segments: &[&str],
        method: &str,
        params: &mut Vec<(String, String)>,
        allowed: &mut BTreeSet<String>,
    ) -> Option<&'a RouteEntry> {
        let Some((&segment, remaining)) = segments.split_first() else {
            return node.accept(method, allowed);
        };

        // Literal children take precedence (most specific match).
        if let Some(child) = node.static_children.get(segment) {
            if let Some(entry) = Self::traverse_and_match(child, remaining, method, params, allowed) {
                return Some(entry);
            }
        }

        if let Some(param_child) = &node.param_child {
            let param_len = params.len();
            params.push((param_child.name.clone(), segment.to_string()));

            if let Some(entry) = Self::traverse_and_match(&param_child.node, remaining, method, params, allowed) {
                return Some(entry);
            }

            params.truncate(param_len);
        }

        // Greedy tail consumes the current segment and everything after it.
        if let Some(wildcard_child) = &node.wildcard_child {
            if let Some(entry) = wildcard_child.node.accept(method, allowed) {
                params.push((wildcard_child.name.clone(), segments.join("/")));
                return Some(entry);
            }
        }

        None
    }
}

impl Node {
    /// The entry for `method` (or `ANY`) at this node. On a miss, the
    /// node's methods are recorded as alternatives.
    fn accept(&self, method: &str, allowed: &mut BTreeSet<String>) -> Option<&RouteEntry> {
        let entry = self.methods.get(method).or_else(|| self.methods.get(ANY_METHOD));
        if entry.is_none() {
            allowed.extend(self.methods.keys().cloned());
        }
        entry
    }
}

fn check_param_name(path: &str, name: &str, existing: &str) -> Result<(), RouteConflict> {
    if name == existing {
        Ok(())
    } else {
        Err(RouteConflict::ParamName {
            path: path.to_string(),
            name: name.to_string(),
            existing: existing.to_string(),
        })
    }
}

/// Parse a path template into segments.
fn parse_path_template(path: &str) -> Result<Vec<Segment>, RouteConflict> {
    let invalid = |reason: &str| RouteConflict::InvalidTemplate {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if !path.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }

    let raw: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());

    for (i, s) in raw.iter().enumerate() {
        let segment = if let Some(inner) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            if let Some(base) = inner.strip_suffix('+') {
                if i + 1 != raw.len() {
                    return Err(invalid("greedy segment must be last"));
                }
                Segment::Wildcard(base.to_string())
            } else {
                Segment::Param(inner.to_string())
            }
        } else {
            if s.contains('{') || s.contains('}') {
                return Err(invalid("braces are only allowed around a whole segment"));
            }
            Segment::Static(s.to_string())
        };

        if let Segment::Param(name) | Segment::Wildcard(name) = &segment {
            if name.is_empty() || name.contains(['{', '}', '+']) {
                return Err(invalid("parameter names must be non-empty identifiers"));
            }
        }
        segments.push(segment);
    }

    Ok(segments)
}

/// Normalize a request path: strip trailing slashes, collapse double slashes.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    let mut prev_slash = false;

    for ch in path.chars() {
        if ch == '/' {
            if !prev_slash {
                normalized.push('/');
            }
            prev_slash = true;
        } else {
            normalized.push(ch);
            prev_slash = false;
        }
    }

    // Strip trailing slash (but keep root "/")
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }

    if normalized.is_empty() {
        "/".to_string()
    } else {
        normalized
    }
}
