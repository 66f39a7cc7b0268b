//! Mutations accepted by the dispatch table.

use crate::health::StatusChange;
use crate::model::{Api, AppliedPlugins, Bind, Cluster, Plugin, ProxyInfo, Routing, Server};

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    AddApi(Api),
    UpdateApi(Api),
    RemoveApi(u64),

    AddCluster(Cluster),
    UpdateCluster(Cluster),
    RemoveCluster(u64),

    AddServer(Server),
    UpdateServer(Server),
    RemoveServer(u64),

    AddBind(Bind),
    RemoveBind(Bind),

    AddRouting(Routing),
    UpdateRouting(Routing),
    RemoveRouting(u64),

    AddProxy(ProxyInfo),
    UpdateProxy(ProxyInfo),
    RemoveProxy(String),

    AddPlugin(Plugin),
    UpdatePlugin(Plugin),
    RemovePlugin(u64),
    SetAppliedPlugins(AppliedPlugins),

    ServerStatus(StatusChange),
}

impl Mutation {
    /// Short label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::AddApi(_) => "add-api",
            Mutation::UpdateApi(_) => "update-api",
            Mutation::RemoveApi(_) => "remove-api",
            Mutation::AddCluster(_) => "add-cluster",
            Mutation::UpdateCluster(_) => "update-cluster",
            Mutation::RemoveCluster(_) => "remove-cluster",
            Mutation::AddServer(_) => "add-server",
            Mutation::UpdateServer(_) => "update-server",
            Mutation::RemoveServer(_) => "remove-server",
            Mutation::AddBind(_) => "add-bind",
            Mutation::RemoveBind(_) => "remove-bind",
            Mutation::AddRouting(_) => "add-routing",
            Mutation::UpdateRouting(_) => "update-routing",
            Mutation::RemoveRouting(_) => "remove-routing",
            Mutation::AddProxy(_) => "add-proxy",
            Mutation::UpdateProxy(_) => "update-proxy",
            Mutation::RemoveProxy(_) => "remove-proxy",
            Mutation::AddPlugin(_) => "add-plugin",
            Mutation::UpdatePlugin(_) => "update-plugin",
            Mutation::RemovePlugin(_) => "remove-plugin",
            Mutation::SetAppliedPlugins(_) => "set-applied-plugins",
            Mutation::ServerStatus(_) => "server-status",
        }
    }
}
