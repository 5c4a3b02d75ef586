//! The radix tree and its lookup algorithm.

use ahash::HashMap as AHashMap;
use thiserror::Error;

/// Errors raised while registering routes.
#[derive(Error, Debug, PartialEq)]
pub enum RouterError {
    /// The same `(method, pattern)` pair was registered twice.
    #[error("Duplicate route: {method} {pattern}")]
    DuplicateRoute { method: String, pattern: String },

    /// The pattern is structurally invalid.
    #[error("Invalid route pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Two patterns disagree on the parameter name at the same position.
    #[error("Conflicting parameter :{new} at a position already using :{existing}")]
    ConflictingParameter { existing: String, new: String },
}

/// Parameters bound during a successful lookup.
///
/// `:name` binds under its name, `*` under `"*"`, `**` under `"**"` (the
/// joined remainder).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteParams(Vec<(String, String)>);

impl RouteParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, name: &str, value: String) {
        self.0.push((name.to_string(), value));
    }
}

/// Verdict of a lookup.
#[derive(Debug, PartialEq)]
pub enum RouteLookup<'a, T> {
    /// A route matched; the leaf value and bound parameters.
    Found { value: &'a T, params: RouteParams },
    /// A node matched the path but not the method. `allow` lists the methods
    /// that would have, for the 405 `Allow` header.
    MethodNotAllowed { allow: Vec<String> },
    /// Nothing matched the path.
    NotFound,
}

#[derive(Debug)]
struct Node<T> {
    children: AHashMap<String, Node<T>>,
    /// `:name` child, at most one per node.
    param: Option<(String, Box<Node<T>>)>,
    /// `*` child, at most one per node.
    wildcard: Option<Box<Node<T>>>,
    /// `**` leaf values by method; terminal by construction.
    catch_all: Option<AHashMap<String, T>>,
    /// Leaf values by method at this exact depth.
    methods: AHashMap<String, T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: AHashMap::default(),
            param: None,
            wildcard: None,
            catch_all: None,
            methods: AHashMap::default(),
        }
    }
}

/// A compiled route table.
#[derive(Debug, Default)]
pub struct RouteTable<T> {
    root: Node<T>,
    len: usize,
}

impl<T> RouteTable<T> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }

    /// Number of registered `(method, pattern)` entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Registers `value` under `(method, pattern)`.
    pub fn insert(&mut self, method: &str, pattern: &str, value: T) -> Result<(), RouterError> {
        let segments = parse_pattern(pattern)?;
        let method = method.to_ascii_uppercase();

        let mut node = &mut self.root;
        for (i, segment) in segments.iter().enumerate() {
            match segment {
                PatternSegment::Static(text) => {
                    node = node.children.entry(text.clone()).or_default();
                }
                PatternSegment::Param(name) => {
                    match node.param {
                        Some((ref existing, _)) if existing != name => {
                            return Err(RouterError::ConflictingParameter {
                                existing: existing.clone(),
                                new: name.clone(),
                            });
                        }
                        Some(_) => {}
                        None => node.param = Some((name.clone(), Box::default())),
                    }
                    node = match node.param {
                        Some((_, ref mut child)) => child.as_mut(),
                        None => unreachable!("param child installed above"),
                    };
                }
                PatternSegment::Wildcard => {
                    node = node.wildcard.get_or_insert_with(Box::default);
                }
                PatternSegment::CatchAll => {
                    debug_assert_eq!(i, segments.len() - 1);
                    let map = node.catch_all.get_or_insert_with(AHashMap::default);
                    if map.contains_key(&method) {
                        return Err(RouterError::DuplicateRoute {
                            method,
                            pattern: pattern.to_string(),
                        });
                    }
                    map.insert(method, value);
                    self.len += 1;
                    return Ok(());
                }
            }
        }

        if node.methods.contains_key(&method) {
            return Err(RouterError::DuplicateRoute {
                method,
                pattern: pattern.to_string(),
            });
        }
        node.methods.insert(method, value);
        self.len += 1;
        Ok(())
    }

    /// Resolves `(method, path)` against the table.
    pub fn lookup<'a>(&'a self, method: &str, path: &str) -> RouteLookup<'a, T> {
        let segments: Vec<&str> = split_path(path);
        let method = method.to_ascii_uppercase();

        let mut params = RouteParams::default();
        match find(&self.root, &segments, 0, &mut params) {
            Some(found) => {
                let methods = match found {
                    FoundNode::Exact(node) => &node.methods,
                    FoundNode::CatchAll(map) => map,
                };
                match methods.get(&method) {
                    Some(value) => RouteLookup::Found { value, params },
                    None => {
                        let mut allow: Vec<String> = methods.keys().cloned().collect();
                        allow.sort();
                        RouteLookup::MethodNotAllowed { allow }
                    }
                }
            }
            None => RouteLookup::NotFound,
        }
    }
}

enum FoundNode<'a, T> {
    Exact(&'a Node<T>),
    CatchAll(&'a AHashMap<String, T>),
}

/// Depth-first search honoring static > param > `*` > `**` precedence, with
/// backtracking when a more specific branch dead-ends.
fn find<'a, T>(
    node: &'a Node<T>,
    segments: &[&str],
    depth: usize,
    params: &mut RouteParams,
) -> Option<FoundNode<'a, T>> {
    if depth == segments.len() {
        if node.methods.is_empty() {
            return None;
        }
        return Some(FoundNode::Exact(node));
    }

    let segment = segments[depth];

    if let Some(child) = node.children.get(segment) {
        if let Some(found) = find(child, segments, depth + 1, params) {
            return Some(found);
        }
    }

    if let Some((ref name, ref child)) = node.param {
        let checkpoint = params.0.len();
        params.push(name, segment.to_string());
        if let Some(found) = find(child, segments, depth + 1, params) {
            return Some(found);
        }
        params.0.truncate(checkpoint);
    }

    if let Some(ref child) = node.wildcard {
        let checkpoint = params.0.len();
        params.push("*", segment.to_string());
        if let Some(found) = find(child, segments, depth + 1, params) {
            return Some(found);
        }
        params.0.truncate(checkpoint);
    }

    if let Some(ref map) = node.catch_all {
        // Terminal: swallows the non-empty remainder.
        params.push("**", segments[depth..].join("/"));
        return Some(FoundNode::CatchAll(map));
    }

    None
}

#[derive(Debug, PartialEq)]
enum PatternSegment {
    Static(String),
    Param(String),
    Wildcard,
    CatchAll,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn parse_pattern(pattern: &str) -> Result<Vec<PatternSegment>, RouterError> {
    if !pattern.starts_with('/') {
        return Err(RouterError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "must start with '/'".to_string(),
        });
    }

    let raw: Vec<&str> = split_path(pattern);
    let mut segments = Vec::with_capacity(raw.len());

    for (i, seg) in raw.iter().enumerate() {
        let parsed = if *seg == "**" {
            if i != raw.len() - 1 {
                return Err(RouterError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "'**' must be the final segment".to_string(),
                });
            }
            PatternSegment::CatchAll
        } else if *seg == "*" {
            PatternSegment::Wildcard
        } else if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(RouterError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: format!("bad parameter name in segment '{}'", seg),
                });
            }
            PatternSegment::Param(name.to_string())
        } else if seg.contains(':') || seg.contains('*') {
            return Err(RouterError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: format!("'{}' mixes literal text with pattern syntax", seg),
            });
        } else {
            PatternSegment::Static(seg.to_string())
        };
        segments.push(parsed);
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(routes: &[(&str, &str)]) -> RouteTable<usize> {
        let mut t = RouteTable::new();
        for (i, (method, pattern)) in routes.iter().enumerate() {
            t.insert(method, pattern, i).unwrap();
        }
        t
    }

    fn found(table: &RouteTable<usize>, method: &str, path: &str) -> Option<usize> {
        match table.lookup(method, path) {
            RouteLookup::Found { value, .. } => Some(*value),
            _ => None,
        }
    }

    #[test]
    fn static_beats_param_beats_wildcards() {
        let t = table(&[
            ("GET", "/files/special"),
            ("GET", "/files/:name"),
            ("GET", "/files/*"),
            ("GET", "/files/**"),
        ]);
        assert_eq!(found(&t, "GET", "/files/special"), Some(0));
        assert_eq!(found(&t, "GET", "/files/other"), Some(1));
        assert_eq!(found(&t, "GET", "/files/a/b"), Some(3));
    }

    #[test]
    fn params_bind_segment_values() {
        let t = table(&[("GET", "/users/:id/posts/:post")]);
        match t.lookup("GET", "/users/42/posts/7") {
            RouteLookup::Found { params, .. } => {
                assert_eq!(params.get("id"), Some("42"));
                assert_eq!(params.get("post"), Some("7"));
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn catch_all_binds_remainder() {
        let t = table(&[("GET", "/static/**")]);
        match t.lookup("GET", "/static/css/site/main.css") {
            RouteLookup::Found { params, .. } => {
                assert_eq!(params.get("**"), Some("css/site/main.css"));
            }
            other => panic!("expected match, got {:?}", other),
        }
        // The remainder must be non-empty.
        assert_eq!(t.lookup("GET", "/static"), RouteLookup::NotFound);
    }

    #[test]
    fn backtracks_from_static_dead_end_to_param() {
        // /a/special exists only for the deeper path; /a/:x/leaf must still
        // match /a/special/leaf when the static branch has no /leaf child.
        let t = table(&[("GET", "/a/special/only"), ("GET", "/a/:x/leaf")]);
        assert_eq!(found(&t, "GET", "/a/special/leaf"), Some(1));
        assert_eq!(found(&t, "GET", "/a/special/only"), Some(0));
    }

    #[test]
    fn not_found_vs_method_not_allowed() {
        let t = table(&[("GET", "/thing"), ("DELETE", "/thing")]);
        assert_eq!(t.lookup("GET", "/nothing"), RouteLookup::NotFound);
        match t.lookup("POST", "/thing") {
            RouteLookup::MethodNotAllowed { allow } => {
                assert_eq!(allow, vec!["DELETE".to_string(), "GET".to_string()]);
            }
            other => panic!("expected 405, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut t = RouteTable::new();
        t.insert("GET", "/x", 0).unwrap();
        assert_eq!(
            t.insert("GET", "/x", 1),
            Err(RouterError::DuplicateRoute {
                method: "GET".to_string(),
                pattern: "/x".to_string()
            })
        );
        // Same pattern, different method is fine.
        assert!(t.insert("POST", "/x", 2).is_ok());
    }

    #[test]
    fn non_terminal_catch_all_is_invalid() {
        let mut t: RouteTable<usize> = RouteTable::new();
        assert!(matches!(
            t.insert("GET", "/a/**/b", 0),
            Err(RouterError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn conflicting_param_names_are_rejected() {
        let mut t = RouteTable::new();
        t.insert("GET", "/u/:id", 0).unwrap();
        assert_eq!(
            t.insert("GET", "/u/:uid", 1),
            Err(RouterError::ConflictingParameter {
                existing: "id".to_string(),
                new: "uid".to_string()
            })
        );
    }

    #[test]
    fn method_matching_is_case_insensitive() {
        let t = table(&[("get", "/x")]);
        assert_eq!(found(&t, "GET", "/x"), Some(0));
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let t = table(&[("GET", "/a/b")]);
        assert_eq!(found(&t, "GET", "/a/b/"), Some(0));
    }
}
