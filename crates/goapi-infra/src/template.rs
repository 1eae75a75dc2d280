//! Template Synthesis
//!
//! Renders a deployment into the engine's template document and a dependency
//! manifest listing every node and edge in declaration order.

use crate::error::InfraResult;
use crate::graph::{DeletionPolicy, Token};
use crate::stack::Deployment;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const FORMAT_VERSION: &str = "2010-09-09";

/// CloudFormation template document
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    pub description: String,
    pub resources: BTreeMap<String, TemplateResource>,
    pub outputs: BTreeMap<String, TemplateOutput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateResource {
    #[serde(rename = "Type")]
    pub resource_type: String,
    pub properties: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<DeletionPolicy>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateOutput {
    pub description: String,
    pub value: Token,
    pub export: Export,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Export {
    pub name: String,
}

impl Template {
    pub fn render(deployment: &Deployment) -> Self {
        let config = &deployment.config;

        let resources = deployment
            .graph
            .iter()
            .map(|r| {
                (
                    r.id.to_string(),
                    TemplateResource {
                        resource_type: r.kind.type_name().to_string(),
                        properties: r.properties.clone(),
                        depends_on: r.depends_on.iter().map(|d| d.to_string()).collect(),
                        deletion_policy: r.deletion_policy,
                        update_replace_policy: r.deletion_policy,
                    },
                )
            })
            .collect();

        let outputs = deployment
            .outputs
            .iter()
            .map(|o| {
                (
                    o.name.clone(),
                    TemplateOutput {
                        description: o.description.clone(),
                        value: o.value.clone(),
                        export: Export {
                            name: format!("{}-{}", config.stack_name, o.name),
                        },
                    },
                )
            })
            .collect();

        Self {
            format_version: FORMAT_VERSION.into(),
            description: format!(
                "{} ({}): containerized API with datastore, event function and bastion",
                config.stack_name,
                config.environment.as_str()
            ),
            resources,
            outputs,
        }
    }

    pub fn to_json_pretty(&self) -> InfraResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Node entry of the dependency manifest
#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub references: Vec<String>,
    pub depends_on: Vec<String>,
}

/// Nodes and edges in declaration order
#[derive(Debug, Clone, Serialize)]
pub struct GraphManifest {
    pub stack: String,
    pub environment: String,
    pub resources: Vec<ManifestEntry>,
}

impl GraphManifest {
    pub fn render(deployment: &Deployment) -> Self {
        Self {
            stack: deployment.config.stack_name.clone(),
            environment: deployment.config.environment.as_str().to_string(),
            resources: deployment
                .graph
                .iter()
                .map(|r| ManifestEntry {
                    id: r.id.to_string(),
                    resource_type: r.kind.type_name().to_string(),
                    references: r.references.iter().map(|d| d.to_string()).collect(),
                    depends_on: r.depends_on.iter().map(|d| d.to_string()).collect(),
                })
                .collect(),
        }
    }
}

/// Files written by a synthesis run
#[derive(Debug, Clone)]
pub struct SynthesizedPaths {
    pub template: PathBuf,
    pub manifest: PathBuf,
}

/// Rendered deployment ready for the engine
#[derive(Debug, Clone)]
pub struct SynthesizedStack {
    pub stack_name: String,
    pub template: Template,
    pub manifest: GraphManifest,
}

impl SynthesizedStack {
    pub fn from_deployment(deployment: &Deployment) -> Self {
        Self {
            stack_name: deployment.config.stack_name.clone(),
            template: Template::render(deployment),
            manifest: GraphManifest::render(deployment),
        }
    }

    /// Write `<stack>.template.json` and `<stack>.graph.json` into `dir`,
    /// creating it if needed.
    pub fn write_to_dir(&self, dir: &Path) -> InfraResult<SynthesizedPaths> {
        std::fs::create_dir_all(dir)?;

        let template = dir.join(format!("{}.template.json", self.stack_name));
        std::fs::write(&template, self.template.to_json_pretty()?)?;

        let manifest = dir.join(format!("{}.graph.json", self.stack_name));
        std::fs::write(&manifest, serde_json::to_string_pretty(&self.manifest)?)?;

        tracing::info!(
            template = %template.display(),
            manifest = %manifest.display(),
            resources = self.template.resources.len(),
            "synthesized stack"
        );

        Ok(SynthesizedPaths { template, manifest })
    }
}
