//! Request predicates and routing-rule selection.
//!
//! # Responsibilities
//! - Evaluate single match items (`==, <, <=, >, >=, in, ~`)
//! - Evaluate AND/OR predicates
//! - Pick the first routing rule that applies to an API
//!
//! # Design Decisions
//! - Numeric operators parse both sides; a parse failure is a non-match
//! - `in` means the request value occurs inside the target text
//! - An absent or empty request value never matches
//! - Regexes compile once per pattern text; invalid ones never match

use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;

use crate::http::request::OriginRequest;
use crate::model::{MatchItem, Operator, Predicate, Routing, Status};
use crate::routing::Params;

/// Predicate evaluator with a shared regex cache.
#[derive(Debug, Default)]
pub struct RuleMatcher {
    regexes: DashMap<String, Option<Regex>>,
}

impl RuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare a raw value against `expect` under `op`.
    pub fn compare(&self, op: Operator, value: &str, expect: &str) -> bool {
        if value.is_empty() {
            return false;
        }

        match op {
            Operator::Eq => value == expect,
            Operator::Lt => int_cmp(value, expect, |a, b| a < b),
            Operator::Le => int_cmp(value, expect, |a, b| a <= b),
            Operator::Gt => int_cmp(value, expect, |a, b| a > b),
            Operator::Ge => int_cmp(value, expect, |a, b| a >= b),
            Operator::In => expect.contains(value),
            Operator::Regex => self.regex_match(expect, value),
        }
    }

    fn regex_match(&self, pattern: &str, value: &str) -> bool {
        if let Some(compiled) = self.regexes.get(pattern) {
            return compiled.as_ref().is_some_and(|re| re.is_match(value));
        }

        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Invalid regex in predicate");
                None
            }
        };
        let matched = compiled.as_ref().is_some_and(|re| re.is_match(value));
        self.regexes.insert(pattern.to_string(), compiled);
        matched
    }

    pub fn item_matches(&self, item: &MatchItem, req: &OriginRequest, params: &Params) -> bool {
        req.value(item.source, &item.name, params)
            .is_some_and(|v| self.compare(item.operator, &v, &item.value))
    }

    /// Every AND item, or failing that any OR item.
    pub fn predicate_matches(&self, predicate: &Predicate, req: &OriginRequest, params: &Params) -> bool {
        if predicate.and.iter().all(|i| self.item_matches(i, req, params)) {
            return true;
        }
        predicate.or.iter().any(|i| self.item_matches(i, req, params))
    }

    /// Every item must hold. Used for cache conditions.
    pub fn all_match(&self, items: &[MatchItem], req: &OriginRequest, params: &Params) -> bool {
        items.iter().all(|i| self.item_matches(i, req, params))
    }

    /// First rule, in order, scoped to `api_id` (or global) whose predicate
    /// holds and whose traffic share admits this request.
    pub fn select<'r>(
        &self,
        routings: &'r [Arc<Routing>],
        api_id: u64,
        req: &OriginRequest,
        params: &Params,
    ) -> Option<&'r Routing> {
        routings
            .iter()
            .map(Arc::as_ref)
            .filter(|r| r.status == Status::Up)
            .filter(|r| r.api_id == 0 || r.api_id == api_id)
            .find(|r| self.predicate_matches(&r.predicate, req, params) && admits(r.traffic_rate))
    }
}

fn int_cmp(value: &str, expect: &str, cmp: impl Fn(i64, i64) -> bool) -> bool {
    match (value.trim().parse::<i64>(), expect.trim().parse::<i64>()) {
        (Ok(a), Ok(b)) => cmp(a, b),
        _ => false,
    }
}

fn admits(traffic_rate: u32) -> bool {
    if traffic_rate == 0 || traffic_rate >= 100 {
        return true;
    }
    fastrand::u32(0..100) < traffic_rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::tests::request;
    use crate::model::{RoutingStrategy, Source};

    fn item(source: Source, name: &str, operator: Operator, value: &str) -> MatchItem {
        MatchItem {
            source,
            name: name.into(),
            operator,
            value: value.into(),
        }
    }

    fn routing(id: u64, api_id: u64, cluster_id: u64, predicate: Predicate) -> Arc<Routing> {
        Arc::new(Routing {
            id,
            name: format!("r{id}"),
            api_id,
            cluster_id,
            strategy: RoutingStrategy::Split,
            predicate,
            traffic_rate: 100,
            status: Status::Up,
        })
    }

    #[test]
    fn test_operators() {
        let m = RuleMatcher::new();
        assert!(m.compare(Operator::Eq, "a", "a"));
        assert!(m.compare(Operator::Lt, "3", "10"));
        assert!(m.compare(Operator::Le, "10", "10"));
        assert!(m.compare(Operator::Gt, "11", "10"));
        assert!(m.compare(Operator::Ge, "10", "10"));
        assert!(!m.compare(Operator::Gt, "x", "10"));
        assert!(m.compare(Operator::In, "beta", "alpha,beta,gamma"));
        assert!(!m.compare(Operator::In, "delta", "alpha,beta"));
        assert!(m.compare(Operator::Regex, "user-42", r"^user-\d+$"));
        assert!(!m.compare(Operator::Regex, "user-42", r"(unclosed"));
        assert!(!m.compare(Operator::Eq, "", ""));
    }

    #[test]
    fn test_and_then_or() {
        let m = RuleMatcher::new();
        let req = request("GET", "/a?v=2", &[("x-tenant", "blue"), ("cookie", "beta=1")], "");
        let params = Params::new();

        let p = Predicate {
            and: vec![
                item(Source::Header, "x-tenant", Operator::Eq, "blue"),
                item(Source::Query, "v", Operator::Ge, "2"),
            ],
            or: vec![],
        };
        assert!(m.predicate_matches(&p, &req, &params));

        let p = Predicate {
            and: vec![item(Source::Header, "x-tenant", Operator::Eq, "red")],
            or: vec![
                item(Source::Query, "v", Operator::Eq, "9"),
                item(Source::Cookie, "beta", Operator::Eq, "1"),
            ],
        };
        assert!(m.predicate_matches(&p, &req, &params));

        let p = Predicate {
            and: vec![item(Source::Header, "x-tenant", Operator::Eq, "red")],
            or: vec![item(Source::Query, "v", Operator::Eq, "9")],
        };
        assert!(!m.predicate_matches(&p, &req, &params));
    }

    #[test]
    fn test_select_first_applicable_rule() {
        let m = RuleMatcher::new();
        let req = request("GET", "/a", &[("x-canary", "yes")], "");
        let params = Params::new();
        let canary = Predicate {
            and: vec![item(Source::Header, "x-canary", Operator::Eq, "yes")],
            or: vec![],
        };

        let rules = vec![
            routing(1, 99, 10, canary.clone()),
            routing(2, 0, 20, canary.clone()),
            routing(3, 5, 30, canary),
        ];
        assert_eq!(m.select(&rules, 5, &req, &params).unwrap().cluster_id, 20);
        assert_eq!(m.select(&rules, 99, &req, &params).unwrap().cluster_id, 10);

        let plain = request("GET", "/a", &[], "");
        assert!(m.select(&rules, 5, &plain, &params).is_none());
    }

    #[test]
    fn test_down_rules_are_skipped() {
        let m = RuleMatcher::new();
        let req = request("GET", "/a", &[], "");
        let mut rule = (*routing(1, 0, 10, Predicate::default())).clone();
        rule.status = Status::Down;
        assert!(m.select(&[Arc::new(rule)], 1, &req, &Params::new()).is_none());
    }
}
