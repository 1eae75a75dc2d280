//! Service Definition
//!
//! The container workload: task shape, image, logging, placement and the two
//! runtime identities (execution and task role).

use crate::config::{DeploymentConfig, ServiceConfig};
use crate::datastore::Datastore;
use crate::error::{InfraError, InfraResult};
use crate::exposure::Exposure;
use crate::graph::{Declaration, ResourceGraph, ResourceRef, Token};
use crate::iam::{self, PermissionSet, ServicePrincipal};
use crate::network::Network;
use crate::security::SecurityBoundaries;
use serde::Serialize;
use std::collections::BTreeMap;

/// Retention values the log service accepts
pub const LOG_RETENTION_DAYS: &[u32] = &[
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

// =============================================================================
// Resource records
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogGroup {
    pub log_group_name: String,
    pub retention_in_days: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskDefinition {
    pub family: String,
    pub cpu: String,
    pub memory: String,
    pub network_mode: String,
    pub requires_compatibilities: Vec<String>,
    pub execution_role_arn: Token,
    pub task_role_arn: Token,
    pub container_definitions: Vec<ContainerDefinition>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub essential: bool,
    pub port_mappings: Vec<PortMapping>,
    pub log_configuration: LogConfiguration,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<KeyValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretInjection>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogConfiguration {
    pub log_driver: String,
    pub options: BTreeMap<String, Token>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValue {
    pub name: String,
    pub value: Token,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecretInjection {
    pub name: String,
    pub value_from: Token,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EcsService {
    pub service_name: String,
    pub cluster: Token,
    pub task_definition: Token,
    pub desired_count: u32,
    pub launch_type: String,
    pub network_configuration: NetworkConfiguration,
    pub load_balancers: Vec<ServiceLoadBalancer>,
    pub health_check_grace_period_seconds: u32,
    pub deployment_configuration: DeploymentConfiguration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkConfiguration {
    pub awsvpc_configuration: AwsvpcConfiguration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AwsvpcConfiguration {
    pub assign_public_ip: String,
    pub subnets: Vec<Token>,
    pub security_groups: Vec<Token>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceLoadBalancer {
    pub container_name: String,
    pub container_port: u16,
    pub target_group_arn: Token,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentConfiguration {
    pub deployment_circuit_breaker: CircuitBreaker,
    pub minimum_healthy_percent: u32,
    pub maximum_percent: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CircuitBreaker {
    pub enable: bool,
    pub rollback: bool,
}

// =============================================================================
// Image references
// =============================================================================

/// Parsed container image URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(uri: &str) -> InfraResult<Self> {
        let invalid = |reason: &str| {
            InfraError::InvalidConfig(format!("image reference `{}`: {}", uri, reason))
        };

        let (name, digest) = match uri.split_once('@') {
            Some((name, digest)) if digest.starts_with("sha256:") && digest.len() > 7 => {
                (name, Some(digest.to_string()))
            }
            Some(_) => return Err(invalid("malformed digest")),
            None => (uri, None),
        };

        // registry is the first segment when it looks like a host
        let (registry, rest) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest)
            }
            _ => ("docker.io".to_string(), name),
        };

        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag.to_string())),
            _ => (rest, None),
        };

        if repository.is_empty()
            || !repository.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/')
            })
        {
            return Err(invalid("repository must be lowercase alphanumerics"));
        }
        if let Some(tag) = &tag {
            if tag.is_empty() || tag.len() > 128 {
                return Err(invalid("tag must be 1-128 characters"));
            }
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// `(account, region)` for an ECR registry host
    pub fn ecr_location(&self) -> Option<(&str, &str)> {
        let parts: Vec<&str> = self.registry.split('.').collect();
        match parts.as_slice() {
            [account, "dkr", "ecr", region, "amazonaws", ..]
                if account.len() == 12 && account.chars().all(|c| c.is_ascii_digit()) =>
            {
                Some((account, region))
            }
            _ => None,
        }
    }

    /// Repository ARN for ECR images, `None` for other registries
    pub fn ecr_repository_arn(&self) -> Option<String> {
        self.ecr_location().map(|(account, region)| {
            format!(
                "arn:aws:ecr:{}:{}:repository/{}",
                region, account, self.repository
            )
        })
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Whether `cpu`/`memory_mib` is a valid Fargate task size
pub fn is_valid_task_size(cpu: u32, memory_mib: u32) -> bool {
    let (min, max, step) = match cpu {
        256 => return matches!(memory_mib, 512 | 1024 | 2048),
        512 => (1024, 4096, 1024),
        1024 => (2048, 8192, 1024),
        2048 => (4096, 16384, 1024),
        4096 => (8192, 30720, 1024),
        _ => return false,
    };
    (min..=max).contains(&memory_mib) && memory_mib % step == 0
}

pub fn validate_log_retention(days: u32) -> InfraResult<()> {
    if LOG_RETENTION_DAYS.contains(&days) {
        Ok(())
    } else {
        Err(InfraError::InvalidConfig(format!(
            "log retention of {} days is not an accepted value",
            days
        )))
    }
}

pub fn validate(service: &ServiceConfig) -> InfraResult<()> {
    if service.desired_count < 1 {
        return Err(InfraError::InvalidConfig(
            "service replica count must be at least 1".into(),
        ));
    }
    if !is_valid_task_size(service.cpu, service.memory_mib) {
        return Err(InfraError::InvalidConfig(format!(
            "{} CPU units with {} MiB is not a valid Fargate task size",
            service.cpu, service.memory_mib
        )));
    }
    if service.container_port == 0 {
        return Err(InfraError::InvalidConfig("container port must be non-zero".into()));
    }
    if !service.liveness_path.starts_with('/') {
        return Err(InfraError::InvalidConfig(format!(
            "liveness path `{}` must start with '/'",
            service.liveness_path
        )));
    }
    ImageReference::parse(&service.image)?;
    validate_log_retention(service.log_retention_days)
}

/// Declare a log group with the given retention
pub fn declare_log_group(
    graph: &mut ResourceGraph,
    id: &str,
    name: String,
    retention_in_days: u32,
) -> InfraResult<ResourceRef> {
    validate_log_retention(retention_in_days)?;
    graph.declare(Declaration::new(
        id,
        LogGroup {
            log_group_name: name,
            retention_in_days,
        },
    ))
}

// =============================================================================
// Declaration
// =============================================================================

/// Declared container service
#[derive(Debug, Clone)]
pub struct Service {
    pub service: ResourceRef,
    pub task_definition: ResourceRef,
    pub log_group: ResourceRef,
    pub execution_role: ResourceRef,
    pub task_role: ResourceRef,
}

/// Everything the service is wired to
pub struct ServiceContext<'a> {
    pub network: &'a Network,
    pub boundaries: &'a SecurityBoundaries,
    pub cluster: &'a ResourceRef,
    pub exposure: &'a Exposure,
    pub datastore: &'a Datastore,
}

pub fn declare(
    graph: &mut ResourceGraph,
    config: &DeploymentConfig,
    ctx: ServiceContext<'_>,
) -> InfraResult<Service> {
    let svc = &config.service;
    validate(svc)?;
    let image = ImageReference::parse(&svc.image)?;

    tracing::info!(
        service = %svc.name,
        cpu = svc.cpu,
        memory = svc.memory_mib,
        replicas = svc.desired_count,
        "declaring container service"
    );

    let log_group = declare_log_group(
        graph,
        "ServiceLogGroup",
        format!("/ecs/{}/{}", svc.name, config.environment.as_str()),
        svc.log_retention_days,
    )?;

    let injected: Vec<Token> = svc
        .secrets
        .values()
        .map(|name| {
            Token::Literal(config.arn(
                "secretsmanager",
                &format!("secret:{}{}-*", config.permissions.secret_prefix, name),
            ))
        })
        .collect();

    let execution_role = iam::declare_role(
        graph,
        "ServiceExecutionRole",
        "Pulls the service image and ships its logs",
        ServicePrincipal::EcsTasks,
        PermissionSet::new()
            .image_pull(image.ecr_repository_arn())
            .log_write(&log_group)
            .secret_read(injected),
    )?;

    let task_role = iam::declare_role(
        graph,
        "ServiceTaskRole",
        "Runtime identity of the service",
        ServicePrincipal::EcsTasks,
        PermissionSet::new()
            .secret_read(vec![
                Token::Literal(config.arn(
                    "secretsmanager",
                    &format!("secret:{}*", config.permissions.secret_prefix),
                )),
                ctx.datastore.secret.token(),
            ])
            .eventing(config.arn(
                "events",
                &format!("rule/{}*", config.permissions.event_rule_prefix),
            ))
            .datastore_connect(ctx.datastore.db_user_arn.clone()),
    )?;

    let mut environment: Vec<KeyValue> = svc
        .environment
        .iter()
        .map(|(name, value)| KeyValue {
            name: name.clone(),
            value: Token::literal(value.as_str()),
        })
        .collect();
    environment.extend([
        KeyValue {
            name: "DB_HOST".into(),
            value: ctx.datastore.endpoint(),
        },
        KeyValue {
            name: "DB_PORT".into(),
            value: Token::Literal(config.datastore.port.to_string()),
        },
        KeyValue {
            name: "DB_NAME".into(),
            value: Token::literal(config.datastore.database_name.as_str()),
        },
        KeyValue {
            name: "DB_USER".into(),
            value: Token::literal(config.datastore.iam_user.as_str()),
        },
    ]);

    let secrets = svc
        .secrets
        .iter()
        .map(|(var, name)| SecretInjection {
            name: var.clone(),
            value_from: Token::Literal(config.arn(
                "secretsmanager",
                &format!("secret:{}{}", config.permissions.secret_prefix, name),
            )),
        })
        .collect();

    let options = BTreeMap::from([
        ("awslogs-group".to_string(), log_group.token()),
        ("awslogs-region".to_string(), Token::literal(config.region.as_str())),
        ("awslogs-stream-prefix".to_string(), Token::literal(svc.name.as_str())),
    ]);

    let task_definition = graph.declare(Declaration::new(
        "TaskDefinition",
        TaskDefinition {
            family: svc.name.clone(),
            cpu: svc.cpu.to_string(),
            memory: svc.memory_mib.to_string(),
            network_mode: "awsvpc".into(),
            requires_compatibilities: vec!["FARGATE".into()],
            execution_role_arn: execution_role.attr("Arn"),
            task_role_arn: task_role.attr("Arn"),
            container_definitions: vec![ContainerDefinition {
                name: svc.name.clone(),
                image: svc.image.clone(),
                essential: true,
                port_mappings: vec![PortMapping {
                    container_port: svc.container_port,
                    protocol: "tcp".into(),
                }],
                log_configuration: LogConfiguration {
                    log_driver: "awslogs".into(),
                    options,
                },
                environment,
                secrets,
            }],
        },
    ))?;

    if svc.assign_public_ip {
        tracing::warn!(
            service = %svc.name,
            "service tasks will receive public IP addresses"
        );
    }

    let subnets = ctx.network.workload_subnets();
    let mut declaration = Declaration::new(
        "Service",
        EcsService {
            service_name: svc.name.clone(),
            cluster: ctx.cluster.token(),
            task_definition: task_definition.token(),
            desired_count: svc.desired_count,
            launch_type: "FARGATE".into(),
            network_configuration: NetworkConfiguration {
                awsvpc_configuration: AwsvpcConfiguration {
                    assign_public_ip: if svc.assign_public_ip { "ENABLED" } else { "DISABLED" }
                        .into(),
                    subnets: Network::subnet_tokens(subnets),
                    security_groups: vec![ctx.boundaries.service.attr("GroupId")],
                },
            },
            load_balancers: vec![ServiceLoadBalancer {
                container_name: svc.name.clone(),
                container_port: svc.container_port,
                target_group_arn: ctx.exposure.target_group.token(),
            }],
            health_check_grace_period_seconds: svc.health_check_grace_secs,
            deployment_configuration: DeploymentConfiguration {
                deployment_circuit_breaker: CircuitBreaker {
                    enable: true,
                    rollback: true,
                },
                minimum_healthy_percent: 100,
                maximum_percent: 200,
            },
        },
    );
    // targets can only register once a listener routes to the group
    for listener in &ctx.exposure.listeners {
        declaration = declaration.depends_on(listener);
    }
    let service = graph.declare(declaration)?;

    Ok(Service {
        service,
        task_definition,
        log_group,
        execution_role,
        task_role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceKind;
    use crate::stack;

    #[test]
    fn test_parse_ecr_image() {
        let image =
            ImageReference::parse("069597727371.dkr.ecr.us-east-1.amazonaws.com/go-api:latest")
                .unwrap();
        assert_eq!(image.repository, "go-api");
        assert_eq!(image.tag.as_deref(), Some("latest"));
        assert_eq!(
            image.ecr_repository_arn().unwrap(),
            "arn:aws:ecr:us-east-1:069597727371:repository/go-api"
        );
    }

    #[test]
    fn test_parse_other_registries() {
        let hub = ImageReference::parse("library/nginx:1.25").unwrap();
        assert_eq!(hub.registry, "docker.io");
        assert!(hub.ecr_repository_arn().is_none());

        let local = ImageReference::parse("localhost:5000/api").unwrap();
        assert_eq!(local.registry, "localhost:5000");
        assert_eq!(local.tag, None);

        let pinned = ImageReference::parse("ghcr.io/org/api@sha256:abc123").unwrap();
        assert_eq!(pinned.digest.as_deref(), Some("sha256:abc123"));
    }

    #[test]
    fn test_rejects_malformed_images() {
        for uri in ["", "Go-Api:latest", "ghcr.io/org/api@md5:abc", "repo:"] {
            assert!(ImageReference::parse(uri).is_err(), "{}", uri);
        }
    }

    #[test]
    fn test_fargate_task_sizes() {
        assert!(is_valid_task_size(256, 512));
        assert!(is_valid_task_size(512, 4096));
        assert!(is_valid_task_size(4096, 30720));
        assert!(!is_valid_task_size(256, 4096));
        assert!(!is_valid_task_size(1024, 1024));
        assert!(!is_valid_task_size(512, 1536));
        assert!(!is_valid_task_size(300, 1024));
    }

    #[test]
    fn test_validate_rejects_zero_replicas() {
        let mut svc = DeploymentConfig::staging().service;
        svc.desired_count = 0;
        assert!(matches!(validate(&svc), Err(InfraError::InvalidConfig(_))));

        let mut svc = DeploymentConfig::staging().service;
        svc.log_retention_days = 10;
        assert!(validate(&svc).is_err());
    }

    #[test]
    fn test_public_ip_off_by_default() {
        for config in [DeploymentConfig::staging(), DeploymentConfig::production()] {
            let deployment = stack::build(&config).unwrap();
            let node = deployment.graph.get(deployment.service.service.id()).unwrap();
            assert_eq!(
                node.properties["NetworkConfiguration"]["AwsvpcConfiguration"]["AssignPublicIp"],
                "DISABLED"
            );
        }
    }

    #[test]
    fn test_tasks_placed_in_private_subnets_when_present() {
        let deployment = stack::build(&DeploymentConfig::production()).unwrap();
        let node = deployment.graph.get(deployment.service.service.id()).unwrap();
        let ResourceKind::EcsService(service) = &node.kind else {
            panic!("not a service");
        };
        let expected = Network::subnet_tokens(&deployment.network.private_subnets);
        assert_eq!(
            service.network_configuration.awsvpc_configuration.subnets,
            expected
        );
    }

    #[test]
    fn test_service_waits_for_listeners() {
        let deployment = stack::build(&DeploymentConfig::staging()).unwrap();
        let node = deployment.graph.get(deployment.service.service.id()).unwrap();
        for listener in &deployment.exposure.listeners {
            assert!(node.depends_on.contains(listener.id()));
        }
    }

    #[test]
    fn test_execution_role_pulls_only_its_repository() {
        let deployment = stack::build(&DeploymentConfig::staging()).unwrap();
        let node = deployment
            .graph
            .get(deployment.service.execution_role.id())
            .unwrap();
        let ResourceKind::Role(role) = &node.kind else {
            panic!("not a role");
        };
        assert!(role.grants("ecr:BatchGetImage"));
        for stmt in role.statements() {
            if stmt.action.iter().any(|a| a == "ecr:BatchGetImage") {
                assert_eq!(
                    stmt.resource,
                    vec![Token::literal(
                        "arn:aws:ecr:us-east-1:069597727371:repository/go-api"
                    )]
                );
            }
        }
    }

    #[test]
    fn test_injected_secret_is_full_arn() {
        let mut config = DeploymentConfig::staging();
        config
            .service
            .secrets
            .insert("API_TOKEN".into(), "api-token".into());
        let deployment = stack::build(&config).unwrap();

        let task = deployment
            .graph
            .get(deployment.service.task_definition.id())
            .unwrap();
        assert_eq!(
            task.properties["ContainerDefinitions"][0]["Secrets"][0]["ValueFrom"],
            "arn:aws:secretsmanager:us-east-1:069597727371:secret:go-api/api-token"
        );

        let node = deployment
            .graph
            .get(deployment.service.execution_role.id())
            .unwrap();
        let ResourceKind::Role(role) = &node.kind else {
            panic!("not a role");
        };
        let expected = Token::literal(
            "arn:aws:secretsmanager:us-east-1:069597727371:secret:go-api/api-token-*",
        );
        assert!(role.statements().any(|stmt| {
            stmt.action.iter().any(|a| a == "secretsmanager:GetSecretValue")
                && stmt.resource.contains(&expected)
        }));
    }
}
