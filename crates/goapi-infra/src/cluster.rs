//! Compute Cluster

use crate::config::DeploymentConfig;
use crate::error::InfraResult;
use crate::graph::{Declaration, ResourceGraph, ResourceRef};
use crate::resources::Tag;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Cluster {
    pub cluster_name: String,
    pub cluster_settings: Vec<ClusterSetting>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterSetting {
    pub name: String,
    pub value: String,
}

/// Declare the deployment's single cluster. Container insights are on in
/// production only.
pub fn declare(graph: &mut ResourceGraph, config: &DeploymentConfig) -> InfraResult<ResourceRef> {
    let insights = config.environment.is_production();
    tracing::info!(insights, "declaring compute cluster");

    graph.declare(Declaration::new(
        "Cluster",
        Cluster {
            cluster_name: format!("{}-cluster", config.service.name),
            cluster_settings: vec![ClusterSetting {
                name: "containerInsights".into(),
                value: if insights { "enabled" } else { "disabled" }.into(),
            }],
            tags: vec![Tag::new("environment", config.environment.as_str())],
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insights_follow_environment() {
        for (config, expected) in [
            (DeploymentConfig::staging(), "disabled"),
            (DeploymentConfig::production(), "enabled"),
        ] {
            let mut graph = ResourceGraph::new();
            let cluster = declare(&mut graph, &config).unwrap();
            let props = &graph.get(cluster.id()).unwrap().properties;
            assert_eq!(props["ClusterSettings"][0]["Value"], expected);
            assert_eq!(props["ClusterName"], "go-api-cluster");
        }
    }
}
