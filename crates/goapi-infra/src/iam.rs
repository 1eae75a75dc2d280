//! Identity & Permission Bindings
//!
//! Runtime identities and their grants. Every statement is validated when
//! its role is declared: no wildcard actions, ARNs must be well-formed and
//! match the action's service, and a `*` resource is accepted only for
//! actions the provider cannot scope to a resource.

use crate::error::{InfraError, InfraResult};
use crate::graph::{Declaration, ResourceGraph, ResourceRef, Token};
use crate::resources::Tag;
use serde::Serialize;

/// Actions without resource-level scoping in the provider's model.
pub const UNSCOPED_ACTIONS: &[&str] = &[
    "ecr:GetAuthorizationToken",
    // The instance identity is granted before the instance exists.
    "ssm:UpdateInstanceInformation",
    "ssmmessages:CreateControlChannel",
    "ssmmessages:CreateDataChannel",
    "ssmmessages:OpenControlChannel",
    "ssmmessages:OpenDataChannel",
    "ec2messages:AcknowledgeMessage",
    "ec2messages:DeleteMessage",
    "ec2messages:FailMessage",
    "ec2messages:GetEndpoint",
    "ec2messages:GetMessages",
    "ec2messages:SendReply",
];

const POLICY_VERSION: &str = "2012-10-17";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Effect {
    Allow,
}

/// One permission grant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    pub effect: Effect,
    pub action: Vec<String>,
    pub resource: Vec<Token>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<PolicyStatement>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrustStatement {
    pub effect: Effect,
    pub principal: ServicePrincipalRecord,
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServicePrincipalRecord {
    pub service: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrustPolicy {
    pub version: String,
    pub statement: Vec<TrustStatement>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InlinePolicy {
    pub policy_name: String,
    pub policy_document: PolicyDocument,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Role {
    pub description: String,
    pub assume_role_policy_document: TrustPolicy,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<InlinePolicy>,
    pub tags: Vec<Tag>,
}

impl Role {
    /// All granted statements
    pub fn statements(&self) -> impl Iterator<Item = &PolicyStatement> {
        self.policies
            .iter()
            .flat_map(|p| p.policy_document.statement.iter())
    }

    /// Whether any statement grants `action`
    pub fn grants(&self, action: &str) -> bool {
        self.statements().any(|s| s.action.iter().any(|a| a == action))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceProfile {
    pub roles: Vec<Token>,
}

/// Service allowed to assume a role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePrincipal {
    EcsTasks,
    Lambda,
    Ec2,
}

impl ServicePrincipal {
    pub fn service(&self) -> &'static str {
        match self {
            Self::EcsTasks => "ecs-tasks.amazonaws.com",
            Self::Lambda => "lambda.amazonaws.com",
            Self::Ec2 => "ec2.amazonaws.com",
        }
    }
}

// =============================================================================
// Grant builders
// =============================================================================

/// Additive set of grants for one identity
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    statements: Vec<PolicyStatement>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, actions: &[&str], resources: Vec<Token>) -> Self {
        self.statements.push(PolicyStatement {
            effect: Effect::Allow,
            action: actions.iter().map(|a| a.to_string()).collect(),
            resource: resources,
        });
        self
    }

    /// Pull one repository's images. Token issuance cannot be scoped; layer
    /// and manifest reads are limited to the repository.
    pub fn image_pull(self, repository_arn: Option<String>) -> Self {
        match repository_arn {
            Some(arn) => self
                .allow(&["ecr:GetAuthorizationToken"], vec![Token::literal("*")])
                .allow(
                    &[
                        "ecr:BatchCheckLayerAvailability",
                        "ecr:GetDownloadUrlForLayer",
                        "ecr:BatchGetImage",
                    ],
                    vec![Token::Literal(arn)],
                ),
            // public registries need no grant
            None => self,
        }
    }

    /// Write to one log group
    pub fn log_write(self, log_group: &ResourceRef) -> Self {
        self.allow(
            &["logs:CreateLogStream", "logs:PutLogEvents"],
            vec![log_group.attr("Arn")],
        )
    }

    /// Read the given secrets
    pub fn secret_read(self, secrets: Vec<Token>) -> Self {
        if secrets.is_empty() {
            return self;
        }
        self.allow(
            &["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"],
            secrets,
        )
    }

    /// Create and list event rules under a name pattern
    pub fn eventing(self, rule_pattern: String) -> Self {
        self.allow(
            &["events:PutRule", "events:ListRules"],
            vec![Token::Literal(rule_pattern)],
        )
    }

    /// IAM-authenticated connect as one database user
    pub fn datastore_connect(self, db_user_arn: Token) -> Self {
        self.allow(&["rds-db:connect"], vec![db_user_arn])
    }

    /// Channel operations the session broker agent needs
    pub fn session_broker(self) -> Self {
        self.allow(
            &[
                "ssm:UpdateInstanceInformation",
                "ssmmessages:CreateControlChannel",
                "ssmmessages:CreateDataChannel",
                "ssmmessages:OpenControlChannel",
                "ssmmessages:OpenDataChannel",
                "ec2messages:AcknowledgeMessage",
                "ec2messages:DeleteMessage",
                "ec2messages:FailMessage",
                "ec2messages:GetEndpoint",
                "ec2messages:GetMessages",
                "ec2messages:SendReply",
            ],
            vec![Token::literal("*")],
        )
    }

    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn validate(&self) -> InfraResult<()> {
        self.statements.iter().try_for_each(validate_statement)
    }
}

// =============================================================================
// Validation
// =============================================================================

fn action_service(action: &str) -> InfraResult<&str> {
    let malformed = || InfraError::MalformedPermission(format!("action `{}`", action));
    let (service, operation) = action.split_once(':').ok_or_else(malformed)?;
    let service_ok = !service.is_empty()
        && service
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let operation_ok =
        !operation.is_empty() && operation.chars().all(|c| c.is_ascii_alphanumeric());
    if service_ok && operation_ok {
        Ok(service)
    } else {
        Err(malformed())
    }
}

/// Components of an ARN pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArnPattern<'a> {
    pub partition: &'a str,
    pub service: &'a str,
    pub region: &'a str,
    pub account: &'a str,
    pub resource: &'a str,
}

/// Split `arn:partition:service:region:account:resource`
pub fn parse_arn(pattern: &str) -> InfraResult<ArnPattern<'_>> {
    let parts: Vec<&str> = pattern.splitn(6, ':').collect();
    match parts.as_slice() {
        ["arn", partition, service, region, account, resource]
            if !partition.is_empty() && !service.is_empty() && !resource.is_empty() =>
        {
            Ok(ArnPattern {
                partition,
                service,
                region,
                account,
                resource,
            })
        }
        _ => Err(InfraError::MalformedPermission(format!(
            "resource `{}` is not an ARN",
            pattern
        ))),
    }
}

/// A resource part naming only a type (`rule/*`, `secret:*`, `*`) covers
/// every resource of that type.
fn is_type_wildcard(resource: &str) -> bool {
    let remainder = match resource.find([':', '/']) {
        Some(i) => &resource[i + 1..],
        None => resource,
    };
    remainder.is_empty() || remainder == "*"
}

/// Check one statement against the least-privilege rules
pub fn validate_statement(statement: &PolicyStatement) -> InfraResult<()> {
    if statement.action.is_empty() || statement.resource.is_empty() {
        return Err(InfraError::MalformedPermission(
            "statement needs at least one action and one resource".into(),
        ));
    }

    let services = statement
        .action
        .iter()
        .map(|a| action_service(a))
        .collect::<InfraResult<Vec<_>>>()?;

    for resource in &statement.resource {
        // a bare reference names exactly one resource
        let Some(pattern) = resource.pattern() else {
            continue;
        };

        if pattern == "*" {
            if let Some(action) = statement
                .action
                .iter()
                .find(|a| !UNSCOPED_ACTIONS.contains(&a.as_str()))
            {
                return Err(InfraError::OverBroadGrant {
                    action: action.clone(),
                    resource: pattern,
                });
            }
            continue;
        }

        let arn = parse_arn(&pattern)?;
        if let Some((action, _)) = statement
            .action
            .iter()
            .zip(&services)
            .find(|(_, service)| **service != arn.service)
        {
            return Err(InfraError::MalformedPermission(format!(
                "action `{}` cannot apply to {} resource `{}`",
                action, arn.service, pattern
            )));
        }
        if arn.region == "*" || arn.account == "*" || is_type_wildcard(arn.resource) {
            let actions: Vec<&str> = statement
                .action
                .iter()
                .zip(&services)
                .filter(|(_, service)| **service == arn.service)
                .map(|(action, _)| action.as_str())
                .collect();
            return Err(InfraError::OverBroadGrant {
                action: actions.join(", "),
                resource: pattern,
            });
        }
    }
    Ok(())
}

/// Validate the grants and declare the role.
pub fn declare_role(
    graph: &mut ResourceGraph,
    id: &str,
    description: &str,
    principal: ServicePrincipal,
    permissions: PermissionSet,
) -> InfraResult<ResourceRef> {
    permissions.validate()?;

    tracing::debug!(
        role = id,
        principal = principal.service(),
        statements = permissions.statements().len(),
        "declaring role"
    );

    let policies = if permissions.is_empty() {
        Vec::new()
    } else {
        vec![InlinePolicy {
            policy_name: format!("{}Policy", id),
            policy_document: PolicyDocument {
                version: POLICY_VERSION.into(),
                statement: permissions.statements,
            },
        }]
    };

    graph.declare(Declaration::new(
        id,
        Role {
            description: description.to_string(),
            assume_role_policy_document: TrustPolicy {
                version: POLICY_VERSION.into(),
                statement: vec![TrustStatement {
                    effect: Effect::Allow,
                    principal: ServicePrincipalRecord {
                        service: principal.service().into(),
                    },
                    action: "sts:AssumeRole".into(),
                }],
            },
            policies,
            tags: vec![],
        },
    ))
}
