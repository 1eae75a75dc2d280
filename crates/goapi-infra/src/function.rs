//! Auxiliary Compute
//!
//! Event-triggered function with its own log group and role. Nothing here
//! references the container service, so the two lifecycles stay independent.

use crate::config::{DeploymentConfig, FunctionConfig};
use crate::error::{InfraError, InfraResult};
use crate::graph::{Declaration, ResourceGraph, ResourceRef, Token};
use crate::iam::{self, PermissionSet, ServicePrincipal};
use crate::service;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Function {
    pub function_name: String,
    pub runtime: String,
    pub handler: String,
    pub code: FunctionCode,
    pub role: Token,
    pub memory_size: u32,
    pub timeout: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<FunctionEnvironment>,
    pub logging_config: LoggingConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionCode {
    pub s3_bucket: String,
    pub s3_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionEnvironment {
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoggingConfig {
    pub log_group: Token,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventRule {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_pattern: Option<serde_json::Value>,
    pub state: String,
    pub targets: Vec<RuleTarget>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleTarget {
    pub arn: Token,
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LambdaPermission {
    pub action: String,
    pub function_name: Token,
    pub principal: String,
    pub source_arn: Token,
}

pub fn validate(function: &FunctionConfig) -> InfraResult<()> {
    if function.name.is_empty() || function.runtime.is_empty() || function.handler.is_empty() {
        return Err(InfraError::InvalidConfig(
            "function name, runtime and handler are required".into(),
        ));
    }
    if !(128..=10240).contains(&function.memory_mib) {
        return Err(InfraError::InvalidConfig(format!(
            "function memory {} MiB outside 128-10240",
            function.memory_mib
        )));
    }
    if !(1..=900).contains(&function.timeout_secs) {
        return Err(InfraError::InvalidConfig(format!(
            "function timeout {}s outside 1-900",
            function.timeout_secs
        )));
    }
    if function.code_bucket.is_empty() || function.code_key.is_empty() {
        return Err(InfraError::InvalidConfig(
            "function code location is incomplete".into(),
        ));
    }

    let trigger = &function.trigger;
    match (&trigger.schedule, &trigger.event_pattern) {
        (Some(schedule), None) => {
            if !(schedule.starts_with("rate(") || schedule.starts_with("cron("))
                || !schedule.ends_with(')')
            {
                return Err(InfraError::InvalidConfig(format!(
                    "schedule `{}` must be a rate() or cron() expression",
                    schedule
                )));
            }
        }
        (None, Some(pattern)) => {
            if !pattern.is_object() {
                return Err(InfraError::InvalidConfig(
                    "event pattern must be a JSON object".into(),
                ));
            }
        }
        _ => {
            return Err(InfraError::InvalidConfig(format!(
                "trigger `{}` needs exactly one of schedule or event pattern",
                trigger.rule_name
            )))
        }
    }
    service::validate_log_retention(function.log_retention_days)
}

/// Declared function and its trigger
#[derive(Debug, Clone)]
pub struct DeployedFunction {
    pub function: ResourceRef,
    pub log_group: ResourceRef,
    pub role: ResourceRef,
    pub rule: ResourceRef,
    pub permission: ResourceRef,
}

impl DeployedFunction {
    pub fn resources(&self) -> [&ResourceRef; 5] {
        [
            &self.function,
            &self.log_group,
            &self.role,
            &self.rule,
            &self.permission,
        ]
    }
}

pub fn declare(graph: &mut ResourceGraph, config: &DeploymentConfig) -> InfraResult<DeployedFunction> {
    let func = &config.function;
    validate(func)?;

    tracing::info!(
        function = %func.name,
        runtime = %func.runtime,
        rule = %func.trigger.rule_name,
        scheduled = func.trigger.schedule.is_some(),
        "declaring auxiliary function"
    );

    let log_group = service::declare_log_group(
        graph,
        "FunctionLogGroup",
        format!("/aws/lambda/{}", func.name),
        func.log_retention_days,
    )?;

    let role = iam::declare_role(
        graph,
        "FunctionRole",
        "Runtime identity of the event function",
        ServicePrincipal::Lambda,
        PermissionSet::new().log_write(&log_group),
    )?;

    let function = graph.declare(Declaration::new(
        "Function",
        Function {
            function_name: func.name.clone(),
            runtime: func.runtime.clone(),
            handler: func.handler.clone(),
            code: FunctionCode {
                s3_bucket: func.code_bucket.clone(),
                s3_key: func.code_key.clone(),
            },
            role: role.attr("Arn"),
            memory_size: func.memory_mib,
            timeout: func.timeout_secs,
            environment: (!func.environment.is_empty()).then(|| FunctionEnvironment {
                variables: func.environment.clone(),
            }),
            logging_config: LoggingConfig {
                log_group: log_group.token(),
            },
        },
    ))?;

    let rule = graph.declare(Declaration::new(
        "FunctionTrigger",
        EventRule {
            name: func.trigger.rule_name.clone(),
            description: format!("Invokes {}", func.name),
            schedule_expression: func.trigger.schedule.clone(),
            event_pattern: func.trigger.event_pattern.clone(),
            state: "ENABLED".into(),
            targets: vec![RuleTarget {
                arn: function.attr("Arn"),
                id: "FunctionTarget".into(),
            }],
        },
    ))?;

    let permission = graph.declare(Declaration::new(
        "FunctionInvokePermission",
        LambdaPermission {
            action: "lambda:InvokeFunction".into(),
            function_name: function.token(),
            principal: "events.amazonaws.com".into(),
            source_arn: rule.attr("Arn"),
        },
    ))?;

    Ok(DeployedFunction {
        function,
        log_group,
        role,
        rule,
        permission,
    })
}
