//! Provisioning Engine Adapter
//!
//! Hands a synthesized template to the external engine and reports its
//! answer. The engine owns ordering, rollback and retries; this adapter
//! never retries and surfaces a rejection exactly as the engine phrased it.

use crate::template::SynthesizedStack;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine rejected `{command}`: {stderr}")]
    Rejected {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("unreadable engine response: {0}")]
    Response(#[from] serde_json::Error),
}

/// Result of a successful deployment
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployReport {
    pub stack_name: String,
    pub outputs: BTreeMap<String, String>,
}

/// External engine that creates and removes stacks
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Create or update `stack` from the template already written at
    /// `template_path`.
    async fn deploy(
        &self,
        stack: &SynthesizedStack,
        template_path: &Path,
    ) -> Result<DeployReport, EngineError>;

    /// Remove a stack and wait until it is gone
    async fn destroy(&self, stack_name: &str) -> Result<(), EngineError>;
}

/// CloudFormation through the `aws` command-line client
#[derive(Debug, Clone)]
pub struct CloudFormationEngine {
    program: String,
    profile: Option<String>,
    region: Option<String>,
}

impl Default for CloudFormationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudFormationEngine {
    pub fn new() -> Self {
        Self {
            program: "aws".into(),
            profile: None,
            region: None,
        }
    }

    /// Use a different client binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(profile) = &self.profile {
            args.extend(["--profile".to_string(), profile.clone()]);
        }
        if let Some(region) = &self.region {
            args.extend(["--region".to_string(), region.clone()]);
        }
        args
    }

    fn cloudformation(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["cloudformation".to_string()];
        args.extend(rest.iter().map(|s| s.to_string()));
        args.extend(self.global_args());
        args
    }

    pub fn deploy_args(&self, stack_name: &str, template_path: &Path) -> Vec<String> {
        let template = template_path.display().to_string();
        self.cloudformation(&[
            "deploy",
            "--stack-name",
            stack_name,
            "--template-file",
            &template,
            "--capabilities",
            "CAPABILITY_NAMED_IAM",
            "--no-fail-on-empty-changeset",
        ])
    }

    pub fn describe_args(&self, stack_name: &str) -> Vec<String> {
        self.cloudformation(&[
            "describe-stacks",
            "--stack-name",
            stack_name,
            "--output",
            "json",
        ])
    }

    pub fn delete_args(&self, stack_name: &str) -> Vec<String> {
        self.cloudformation(&["delete-stack", "--stack-name", stack_name])
    }

    pub fn wait_delete_args(&self, stack_name: &str) -> Vec<String> {
        self.cloudformation(&["wait", "stack-delete-complete", "--stack-name", stack_name])
    }

    async fn run(&self, args: Vec<String>) -> Result<String, EngineError> {
        let command = format!("{} {}", self.program, args.join(" "));
        tracing::debug!(command = %command, "invoking engine");

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|source| EngineError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::Rejected {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacks {
    #[serde(default)]
    stacks: Vec<DescribedStack>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribedStack {
    #[serde(default)]
    outputs: Vec<DescribedOutput>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribedOutput {
    output_key: String,
    output_value: String,
}

/// Collect `OutputKey -> OutputValue` from a `describe-stacks` response
pub fn parse_outputs(json: &str) -> Result<BTreeMap<String, String>, EngineError> {
    let described: DescribeStacks = serde_json::from_str(json)?;
    Ok(described
        .stacks
        .into_iter()
        .flat_map(|s| s.outputs)
        .map(|o| (o.output_key, o.output_value))
        .collect())
}

#[async_trait]
impl ProvisioningEngine for CloudFormationEngine {
    fn name(&self) -> &str {
        "cloudformation"
    }

    async fn deploy(
        &self,
        stack: &SynthesizedStack,
        template_path: &Path,
    ) -> Result<DeployReport, EngineError> {
        tracing::info!(
            stack = %stack.stack_name,
            resources = stack.template.resources.len(),
            "deploying stack"
        );
        self.run(self.deploy_args(&stack.stack_name, template_path))
            .await?;

        let described = self.run(self.describe_args(&stack.stack_name)).await?;
        let outputs = parse_outputs(&described)?;
        tracing::info!(stack = %stack.stack_name, outputs = outputs.len(), "stack deployed");

        Ok(DeployReport {
            stack_name: stack.stack_name.clone(),
            outputs,
        })
    }

    async fn destroy(&self, stack_name: &str) -> Result<(), EngineError> {
        tracing::info!(stack = stack_name, "deleting stack");
        self.run(self.delete_args(stack_name)).await?;
        self.run(self.wait_delete_args(stack_name)).await?;
        tracing::info!(stack = stack_name, "stack deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentConfig;
    use crate::stack;

    #[test]
    fn test_deploy_args() {
        let engine = CloudFormationEngine::new()
            .with_profile(Some("ops".into()))
            .with_region(Some("us-east-1".into()));
        let args = engine.deploy_args("GoApiInfraStack", Path::new("out/GoApiInfraStack.template.json"));

        assert_eq!(&args[..2], &["cloudformation", "deploy"]);
        let capabilities = args.iter().position(|a| a == "--capabilities").unwrap();
        assert_eq!(args[capabilities + 1], "CAPABILITY_NAMED_IAM");
        let profile = args.iter().position(|a| a == "--profile").unwrap();
        assert_eq!(args[profile + 1], "ops");
        assert!(args.contains(&"out/GoApiInfraStack.template.json".to_string()));
    }

    #[test]
    fn test_destroy_args_wait_for_completion() {
        let engine = CloudFormationEngine::new();
        assert_eq!(
            engine.wait_delete_args("S"),
            vec!["cloudformation", "wait", "stack-delete-complete", "--stack-name", "S"]
        );
        assert!(!engine.delete_args("S").contains(&"--profile".to_string()));
    }

    #[test]
    fn test_parse_outputs() {
        let json = r#"{
            "Stacks": [{
                "StackName": "GoApiInfraStack",
                "Outputs": [
                    {"OutputKey": "ServiceURL", "OutputValue": "http://go-api-alb-1.us-east-1.elb.amazonaws.com"},
                    {"OutputKey": "FunctionName", "OutputValue": "go-api-event-notifier"}
                ]
            }]
        }"#;
        let outputs = parse_outputs(json).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs["FunctionName"], "go-api-event-notifier");

        assert!(parse_outputs("not json").is_err());
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let deployment = stack::build(&DeploymentConfig::staging()).unwrap();
        let synthesized = SynthesizedStack::from_deployment(&deployment);
        let engine = CloudFormationEngine::new().with_program("false");

        let err = engine
            .deploy(&synthesized, Path::new("missing.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected { status: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let engine = CloudFormationEngine::new().with_program("/nonexistent/aws-client");
        let err = engine.destroy("GoApiInfraStack").await.unwrap_err();
        assert!(matches!(err, EngineError::Launch { .. }));
    }
}
