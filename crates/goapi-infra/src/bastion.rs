//! Operator Access Path
//!
//! A small instance reached only through the session broker. It has no key
//! pair, no public address and a firewall group without ingress rules.

use crate::config::DeploymentConfig;
use crate::datastore::Datastore;
use crate::error::{InfraError, InfraResult};
use crate::graph::{Declaration, ResourceGraph, ResourceRef, Token};
use crate::iam::{self, InstanceProfile, PermissionSet, ServicePrincipal};
use crate::network::Network;
use crate::resources::Tag;
use crate::security::SecurityBoundaries;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Instance {
    pub instance_type: String,
    pub image_id: String,
    pub iam_instance_profile: Token,
    pub network_interfaces: Vec<NetworkInterface>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInterface {
    pub device_index: String,
    pub associate_public_ip_address: bool,
    pub subnet_id: Token,
    pub group_set: Vec<Token>,
}

pub fn validate(config: &DeploymentConfig) -> InfraResult<()> {
    let bastion = &config.bastion;
    if bastion.instance_type.is_empty() || !bastion.instance_type.contains('.') {
        return Err(InfraError::InvalidConfig(format!(
            "`{}` is not an instance type",
            bastion.instance_type
        )));
    }
    if !bastion.image_parameter.starts_with('/') {
        return Err(InfraError::InvalidConfig(format!(
            "image parameter `{}` must be a parameter path",
            bastion.image_parameter
        )));
    }
    Ok(())
}

/// Declared access path
#[derive(Debug, Clone)]
pub struct Bastion {
    pub instance: ResourceRef,
    pub role: ResourceRef,
    pub profile: ResourceRef,
}

pub fn declare(
    graph: &mut ResourceGraph,
    config: &DeploymentConfig,
    network: &Network,
    boundaries: &SecurityBoundaries,
    datastore: &Datastore,
) -> InfraResult<Bastion> {
    validate(config)?;
    let subnet = network.workload_subnets().first().ok_or_else(|| {
        InfraError::InvalidConfig("network has no subnet for the bastion".into())
    })?;

    tracing::info!(
        instance_type = %config.bastion.instance_type,
        subnet = %subnet.subnet.id(),
        "declaring operator access path"
    );

    let role = iam::declare_role(
        graph,
        "BastionRole",
        "Session-broker access to the datastore",
        ServicePrincipal::Ec2,
        PermissionSet::new()
            .session_broker()
            .datastore_connect(datastore.db_user_arn.clone())
            .secret_read(vec![datastore.secret.token()]),
    )?;

    let profile = graph.declare(Declaration::new(
        "BastionInstanceProfile",
        InstanceProfile {
            roles: vec![role.token()],
        },
    ))?;

    let instance = graph.declare(Declaration::new(
        "Bastion",
        Instance {
            instance_type: config.bastion.instance_type.clone(),
            image_id: format!("{{{{resolve:ssm:{}}}}}", config.bastion.image_parameter),
            iam_instance_profile: profile.token(),
            network_interfaces: vec![NetworkInterface {
                device_index: "0".into(),
                associate_public_ip_address: false,
                subnet_id: subnet.subnet.token(),
                group_set: vec![boundaries.bastion.attr("GroupId")],
            }],
            tags: vec![Tag::name(format!("{}/Bastion", config.stack_name))],
        },
    ))?;

    Ok(Bastion {
        instance,
        role,
        profile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceKind;
    use crate::stack;

    #[test]
    fn test_no_key_and_no_public_address() {
        for config in [DeploymentConfig::staging(), DeploymentConfig::production()] {
            let deployment = stack::build(&config).unwrap();
            let node = deployment.graph.get(deployment.bastion.instance.id()).unwrap();
            assert!(node.properties.get("KeyName").is_none());
            assert_eq!(
                node.properties["NetworkInterfaces"][0]["AssociatePublicIpAddress"],
                false
            );
            assert_eq!(
                node.properties["ImageId"],
                "{{resolve:ssm:/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64}}"
            );
        }
    }

    #[test]
    fn test_role_is_limited_to_access_path() {
        let deployment = stack::build(&DeploymentConfig::production()).unwrap();
        let node = deployment.graph.get(deployment.bastion.role.id()).unwrap();
        let ResourceKind::Role(role) = &node.kind else {
            panic!("not a role");
        };
        assert!(role.grants("ssmmessages:OpenDataChannel"));
        assert!(role.grants("rds-db:connect"));
        assert!(role.grants("secretsmanager:GetSecretValue"));
        assert!(!role.grants("events:PutRule"));
        assert!(!role.grants("ecr:BatchGetImage"));
    }

    #[test]
    fn test_placed_in_private_subnet_when_present() {
        let deployment = stack::build(&DeploymentConfig::production()).unwrap();
        let node = deployment.graph.get(deployment.bastion.instance.id()).unwrap();
        let private = deployment.network.private_subnets[0].subnet.id();
        assert!(node.references.contains(private));
    }
}
