//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! API records (at snapshot build)
//!     → parser.rs (pattern → segments)
//!     → router.rs (segments inserted into the trie)
//!
//! Incoming request (method, path)
//!     → router.rs (api id + path params)
//!     → matcher.rs (API predicate, routing rules: split / copy)
//!     → rewrite.rs (forward URI from `{name}` templates)
//! ```
//!
//! # Design Decisions
//! - The trie is rebuilt on every API mutation and frozen in the snapshot
//! - Priority between siblings is fixed: const, enum, number, string, match-all
//! - Regexes in predicates compile once and are cached by source text

pub mod matcher;
pub mod parser;
pub mod rewrite;
pub mod router;

use thiserror::Error;

pub use matcher::RuleMatcher;
pub use parser::{parse, render, Segment};
pub use rewrite::rewrite;
pub use router::Router;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("conflict: {method} {pattern} already registered")]
    Conflict { pattern: String, method: String },

    #[error("no api matches")]
    NotFound,

    #[error("path matches but method does not")]
    MethodMismatch,
}

/// Path params bound while matching, in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
