//! Plan command

use super::Context;
use crate::output::print_info;
use anyhow::Result;
use goapi_infra::{stack, Deployment};
use serde::Serialize;
use tabled::Tabled;

/// Table row for one declared resource
#[derive(Debug, Serialize, Tabled)]
pub struct ResourceRow {
    /// Logical id
    pub id: String,
    /// Engine type
    #[tabled(rename = "type")]
    pub resource_type: String,
    /// Resources it must be created after
    #[tabled(rename = "depends on")]
    pub depends_on: String,
}

#[derive(Debug, Serialize, Tabled)]
pub struct OutputRow {
    pub name: String,
    pub description: String,
}

pub fn resource_rows(deployment: &Deployment) -> Vec<ResourceRow> {
    deployment
        .graph
        .iter()
        .map(|r| {
            let deps: Vec<&str> = r.dependencies().into_iter().map(|d| d.as_str()).collect();
            ResourceRow {
                id: r.id.to_string(),
                resource_type: r.kind.type_name().to_string(),
                depends_on: if deps.is_empty() {
                    "-".to_string()
                } else {
                    deps.join(", ")
                },
            }
        })
        .collect()
}

pub fn handle(ctx: &Context) -> Result<()> {
    let config = ctx.deployment_config()?;
    let deployment = stack::build(&config)?;

    ctx.format.print_rows(&resource_rows(&deployment))?;

    if ctx.format.is_table() {
        let outputs: Vec<OutputRow> = deployment
            .outputs
            .iter()
            .map(|o| OutputRow {
                name: o.name.clone(),
                description: o.description.clone(),
            })
            .collect();
        ctx.format.print_rows(&outputs)?;
    }

    print_info(&format!(
        "{} resources, {} outputs for {} ({})",
        deployment.graph.len(),
        deployment.outputs.len(),
        config.stack_name,
        config.environment.as_str()
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use goapi_infra::DeploymentConfig;

    #[test]
    fn test_rows_follow_declaration_order() {
        let deployment = stack::build(&DeploymentConfig::staging()).unwrap();
        let rows = resource_rows(&deployment);
        assert_eq!(rows.len(), deployment.graph.len());
        assert_eq!(rows[0].id, "Vpc");
        assert_eq!(rows[0].depends_on, "-");

        let service = rows.iter().find(|r| r.id == "Service").unwrap();
        assert!(service.depends_on.contains("HttpListener"));
    }
}
