//! Deployment Assembly
//!
//! Builds the complete topology for one configuration. Every component is
//! validated before the first resource is declared, so a rejected
//! configuration never leaves a partial graph behind.

use crate::bastion::{self, Bastion};
use crate::cluster;
use crate::config::DeploymentConfig;
use crate::datastore::{self, Datastore};
use crate::error::InfraResult;
use crate::exposure::{self, Exposure};
use crate::function::{self, DeployedFunction};
use crate::graph::{ResourceGraph, ResourceRef, Token};
use crate::network::{self, Network};
use crate::outputs::StackOutputs;
use crate::scaling::{self, Scaling};
use crate::security::{self, SecurityBoundaries};
use crate::service::{self, Service, ServiceContext};

/// A fully declared deployment
#[derive(Debug)]
pub struct Deployment {
    pub config: DeploymentConfig,
    pub graph: ResourceGraph,
    pub network: Network,
    pub boundaries: SecurityBoundaries,
    pub endpoints: Vec<ResourceRef>,
    pub datastore: Datastore,
    pub cluster: ResourceRef,
    pub exposure: Exposure,
    pub service: Service,
    pub function: DeployedFunction,
    pub bastion: Bastion,
    pub scaling: Option<Scaling>,
    pub outputs: StackOutputs,
}

impl Deployment {
    pub fn stack_name(&self) -> &str {
        &self.config.stack_name
    }
}

/// Run every component's checks without declaring anything.
pub fn validate(config: &DeploymentConfig) -> InfraResult<()> {
    config.validate()?;
    network::plan_subnets(&config.network, &config.region)?;
    service::validate(&config.service)?;
    exposure::validate(config)?;
    datastore::validate(config)?;
    function::validate(&config.function)?;
    bastion::validate(config)?;
    if let Some(scaling) = &config.scaling {
        scaling::validate(scaling, config.service.desired_count)?;
    }
    Ok(())
}

/// Assemble the topology, leaves first.
pub fn build(config: &DeploymentConfig) -> InfraResult<Deployment> {
    validate(config)?;

    tracing::info!(
        stack = %config.stack_name,
        environment = config.environment.as_str(),
        region = %config.region,
        "building deployment"
    );

    let mut graph = ResourceGraph::new();
    let network = network::declare(&mut graph, config)?;
    let boundaries = security::declare_boundaries(&mut graph, config, &network)?;
    let endpoints = match &boundaries.endpoints {
        Some(group) => network::declare_endpoints(&mut graph, config, &network, group)?,
        None => Vec::new(),
    };
    let datastore = datastore::declare(&mut graph, config, &network, &boundaries)?;
    let cluster = cluster::declare(&mut graph, config)?;
    let exposure = exposure::declare(&mut graph, config, &network, &boundaries)?;
    let service = service::declare(
        &mut graph,
        config,
        ServiceContext {
            network: &network,
            boundaries: &boundaries,
            cluster: &cluster,
            exposure: &exposure,
            datastore: &datastore,
        },
    )?;
    let function = function::declare(&mut graph, config)?;
    let bastion = bastion::declare(&mut graph, config, &network, &boundaries, &datastore)?;
    let scaling = match &config.scaling {
        Some(scaling) => Some(scaling::declare(
            &mut graph,
            config,
            scaling,
            &cluster,
            &service.service,
        )?),
        None => None,
    };

    let mut outputs = StackOutputs::new();
    outputs.add(
        &graph,
        "LoadBalancerDNS",
        "Public DNS name of the load balancer",
        exposure.load_balancer.attr("DNSName"),
    )?;
    outputs.add(
        &graph,
        "ServiceURL",
        "Base URL of the service",
        Token::join([
            Token::Literal(format!("{}://", exposure.scheme())),
            exposure.load_balancer.attr("DNSName"),
        ]),
    )?;
    outputs.add(
        &graph,
        "FunctionName",
        "Name of the event function",
        function.function.token(),
    )?;
    outputs.add(
        &graph,
        "DatastoreEndpoint",
        "Writer endpoint of the datastore",
        datastore.endpoint(),
    )?;
    outputs.add(
        &graph,
        "DatastoreSecretArn",
        "Secret holding the datastore credentials",
        datastore.secret.token(),
    )?;
    outputs.add(
        &graph,
        "BastionInstanceId",
        "Instance to open sessions on",
        bastion.instance.token(),
    )?;

    tracing::info!(
        resources = graph.len(),
        outputs = outputs.len(),
        "deployment assembled"
    );

    Ok(Deployment {
        config: config.clone(),
        graph,
        network,
        boundaries,
        endpoints,
        datastore,
        cluster,
        exposure,
        service,
        function,
        bastion,
        scaling,
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InfraError;
    use crate::resources::ResourceKind;
    use crate::security::TrafficSource;

    fn both() -> [DeploymentConfig; 2] {
        [DeploymentConfig::staging(), DeploymentConfig::production()]
    }

    #[test]
    fn test_presets_build() {
        for config in both() {
            let deployment = build(&config).unwrap();
            assert_eq!(deployment.graph.of_type("AWS::ECS::Cluster").count(), 1);
            assert_eq!(deployment.scaling.is_some(), config.environment.is_production());
        }
    }

    #[test]
    fn test_declaration_order_is_topological() {
        for config in both() {
            let deployment = build(&config).unwrap();
            let mut seen = std::collections::BTreeSet::new();
            for resource in deployment.graph.iter() {
                for dep in resource.dependencies() {
                    assert!(seen.contains(dep), "{} before {}", resource.id, dep);
                }
                seen.insert(resource.id.clone());
            }
        }
    }

    #[test]
    fn test_every_grant_is_narrow() {
        for config in both() {
            let deployment = build(&config).unwrap();
            for resource in deployment.graph.iter() {
                if let ResourceKind::Role(role) = &resource.kind {
                    for stmt in role.statements() {
                        crate::iam::validate_statement(stmt).unwrap();
                    }
                }
            }
        }
    }

    #[test]
    fn test_isolation_holds_in_both_subnet_modes() {
        let internet = TrafficSource::Address("203.0.113.50".parse().unwrap());
        for config in both() {
            let deployment = build(&config).unwrap();
            let sg = &deployment.boundaries;
            let graph = &deployment.graph;

            let datastore = security::lookup(graph, sg.datastore.id()).unwrap();
            let bastion = security::lookup(graph, sg.bastion.id()).unwrap();
            for port in [22, 443, config.datastore.port] {
                assert!(!datastore.admits(&internet, port));
                assert!(!bastion.admits(&internet, port));
            }

            let instance = graph.get(deployment.datastore.instance.id()).unwrap();
            assert_eq!(instance.properties["PubliclyAccessible"], false);
        }
    }

    #[test]
    fn test_toggling_private_subnets_removes_nat() {
        let prod = build(&DeploymentConfig::production()).unwrap();
        assert!(prod.graph.of_type("AWS::EC2::NatGateway").count() > 0);
        assert!(prod.endpoints.is_empty());

        let mut config = DeploymentConfig::production();
        config.network.subnet_mode = crate::config::SubnetMode::PublicOnly;
        let public_only = build(&config).unwrap();
        assert_eq!(public_only.graph.of_type("AWS::EC2::NatGateway").count(), 0);
        assert_eq!(public_only.graph.of_type("AWS::EC2::EIP").count(), 0);
        assert!(!public_only.endpoints.is_empty());

        let endpoints: Vec<&str> = public_only
            .graph
            .of_type("AWS::EC2::VPCEndpoint")
            .filter_map(|e| e.properties["ServiceName"].as_str())
            .collect();
        let roles = [
            &public_only.service.execution_role,
            &public_only.service.task_role,
            &public_only.bastion.role,
        ];
        for role in roles {
            let ResourceKind::Role(role) = &public_only.graph.get(role.id()).unwrap().kind else {
                panic!("not a role");
            };
            for action in role.statements().flat_map(|s| s.action.iter()) {
                let service = action.split(':').next().unwrap();
                // database tokens are signed locally
                let suffix = match service {
                    "rds-db" => continue,
                    "ecr" => "ecr.api",
                    other => other,
                };
                assert!(
                    endpoints.iter().any(|e| e.ends_with(&format!(".{}", suffix))),
                    "{} has no endpoint",
                    action
                );
            }
        }
    }

    #[test]
    fn test_function_decoupled_from_service() {
        for config in both() {
            let deployment = build(&config).unwrap();
            let graph = &deployment.graph;
            let service = [
                &deployment.service.service,
                &deployment.service.task_definition,
                &deployment.service.task_role,
                &deployment.service.execution_role,
            ];
            for f in deployment.function.resources() {
                for s in service {
                    assert!(!graph.depends_transitively(f.id(), s.id()));
                    assert!(!graph.depends_transitively(s.id(), f.id()));
                }
            }
        }
    }

    #[test]
    fn test_health_mismatch_rejected_before_declaring() {
        let mut config = DeploymentConfig::production();
        config.exposure.health_check.path = "/".into();
        assert!(matches!(
            build(&config),
            Err(InfraError::HealthCheckMismatch { .. })
        ));
    }

    #[test]
    fn test_scaling_outside_bounds_rejected() {
        let mut config = DeploymentConfig::production();
        config.service.desired_count = 9;
        assert!(matches!(build(&config), Err(InfraError::InvalidScaling(_))));
    }
}
