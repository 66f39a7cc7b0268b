//! Traffic-steering records and the predicate vocabulary shared with
//! cache conditions and validations.

use serde::{Deserialize, Serialize};

use super::Status;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Routing {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// 0 applies the rule to every API.
    #[serde(default)]
    pub api_id: u64,
    pub cluster_id: u64,
    #[serde(default)]
    pub strategy: RoutingStrategy,
    #[serde(default)]
    pub predicate: Predicate,
    /// Percentage of matching requests the rule applies to; 0 means all.
    #[serde(default)]
    pub traffic_rate: u32,
    #[serde(default)]
    pub status: Status,
}

impl Routing {
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster_id == 0 {
            return Err("missing cluster".into());
        }
        if self.traffic_rate > 100 {
            return Err(format!("error traffic rate: {}", self.traffic_rate));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Replace the destination server.
    #[default]
    Split,
    /// Keep the destination and send a shadow copy.
    Copy,
}

/// AND items with an OR fallback.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Predicate {
    pub and: Vec<MatchItem>,
    pub or: Vec<MatchItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MatchItem {
    pub source: Source,
    pub name: String,
    pub operator: Operator,
    pub value: String,
}

/// A named request value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Param {
    pub source: Source,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Header,
    Cookie,
    Query,
    Form,
    JsonBody,
    PathValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Operator {
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "le")]
    Le,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "~", alias = "regex")]
    Regex,
}
