//! URL pattern trie.
//!
//! # Responsibilities
//! - Store compiled API patterns, one leaf per pattern, methods multiplexed
//! - Look up `(path, method)` and report bound path params
//! - Reject duplicate `(pattern, method)` registrations
//!
//! # Design Decisions
//! - Children are kept ordered `const > enum > number > string > *`
//! - At each level the first child accepting the token is taken; no backtracking
//! - Params are reported only once the whole path matched
//! - Immutable once published in a dispatch snapshot

use super::parser::{parse, Segment};
use super::RouteError;

#[derive(Debug, Clone, Default)]
struct Node {
    segment: Option<Segment>,
    children: Vec<Node>,
    /// `(method, api id)` registered on this exact pattern.
    apis: Vec<(String, u64)>,
}

impl Node {
    fn child_mut(&mut self, segment: &Segment) -> &mut Node {
        if let Some(i) = self
            .children
            .iter()
            .position(|c| c.segment.as_ref() == Some(segment))
        {
            return &mut self.children[i];
        }

        let rank = segment.rank();
        let at = self
            .children
            .iter()
            .position(|c| c.segment.as_ref().map_or(u8::MAX, Segment::rank) > rank)
            .unwrap_or(self.children.len());
        self.children.insert(
            at,
            Node {
                segment: Some(segment.clone()),
                ..Node::default()
            },
        );
        &mut self.children[at]
    }

    fn is_empty(&self) -> bool {
        self.apis.is_empty() && self.children.is_empty()
    }

    fn remove(&mut self, api_id: u64) -> bool {
        let before = self.apis.len();
        self.apis.retain(|(_, id)| *id != api_id);
        let mut removed = self.apis.len() != before;
        for child in &mut self.children {
            removed |= child.remove(api_id);
        }
        self.children.retain(|c| !c.is_empty());
        removed
    }
}

/// Maps method + path to an API id.
#[derive(Debug, Clone, Default)]
pub struct Router {
    root: Node,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `api_id` under `pattern` and `method` (`*` for any).
    pub fn add(&mut self, pattern: &str, method: &str, api_id: u64) -> Result<(), RouteError> {
        let segments = parse(pattern)?;
        let method = method.to_ascii_uppercase();

        let mut node = &mut self.root;
        for segment in &segments {
            node = node.child_mut(segment);
        }

        let conflict = node
            .apis
            .iter()
            .any(|(m, _)| m == &method || m == "*" || method == "*");
        if conflict {
            return Err(RouteError::Conflict {
                pattern: pattern.to_string(),
                method,
            });
        }

        node.apis.push((method, api_id));
        Ok(())
    }

    /// Drop every registration of `api_id`.
    pub fn remove(&mut self, api_id: u64) -> bool {
        self.root.remove(api_id)
    }

    /// Match `path` and `method`. On success `on_param` sees every bound
    /// `(name, value)` in path order.
    pub fn find<F>(&self, path: &str, method: &str, mut on_param: F) -> Result<u64, RouteError>
    where
        F: FnMut(&str, &str),
    {
        let trimmed = path.trim_start_matches('/');
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

        let mut params: Vec<(&str, &str)> = Vec::new();
        let mut node = &self.root;
        let mut rest = trimmed;

        while !rest.is_empty() {
            let (token, tail) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i + 1..]),
                None => (rest, ""),
            };

            let Some(child) = node
                .children
                .iter()
                .find(|c| c.segment.as_ref().is_some_and(|s| s.accepts(token)))
            else {
                return Err(RouteError::NotFound);
            };

            match child.segment.as_ref() {
                Some(Segment::MatchAll) => {
                    params.push(("*", rest));
                    rest = "";
                }
                Some(segment) => {
                    if let Some(name) = segment.name() {
                        params.push((name, token));
                    }
                    rest = tail;
                }
                None => return Err(RouteError::NotFound),
            }
            node = child;
        }

        if node.apis.is_empty() {
            return Err(RouteError::NotFound);
        }

        let api = node
            .apis
            .iter()
            .find(|(m, _)| m.eq_ignore_ascii_case(method))
            .or_else(|| node.apis.iter().find(|(m, _)| m == "*"));

        match api {
            Some((_, id)) => {
                for (name, value) in params {
                    on_param(name, value);
                }
                Ok(*id)
            }
            None => Err(RouteError::MethodMismatch),
        }
    }
}
