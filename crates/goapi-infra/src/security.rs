//! Security Boundaries
//!
//! Firewall groups for every component, declared together. Subnet placement
//! alone never isolates anything here: the datastore and the bastion stay
//! unreachable from the internet in both subnet modes because their groups
//! admit nothing from outside the allow-list.

use crate::config::DeploymentConfig;
use crate::error::InfraResult;
use crate::graph::{Declaration, ResourceGraph, ResourceId, ResourceRef, Token};
use crate::network::Network;
use crate::resources::{ResourceKind, Tag};
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// HTTPS port used by the TLS listener and the private endpoints
pub const HTTPS_PORT: u16 = 443;
pub const HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityGroup {
    pub group_description: String,
    pub vpc_id: Token,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_group_ingress: Vec<IngressRule>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IngressRule {
    pub ip_protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_security_group_id: Option<Token>,
    pub description: String,
}

impl IngressRule {
    /// TCP port open to an address range
    pub fn from_cidr(port: u16, cidr: &str, description: &str) -> Self {
        Self {
            ip_protocol: "tcp".into(),
            from_port: port,
            to_port: port,
            cidr_ip: Some(cidr.to_string()),
            source_security_group_id: None,
            description: description.to_string(),
        }
    }

    /// TCP port open to members of another group
    pub fn from_group(port: u16, group: &ResourceRef, description: &str) -> Self {
        Self {
            ip_protocol: "tcp".into(),
            from_port: port,
            to_port: port,
            cidr_ip: None,
            source_security_group_id: Some(group.attr("GroupId")),
            description: description.to_string(),
        }
    }

    fn covers(&self, port: u16) -> bool {
        (self.from_port..=self.to_port).contains(&port)
    }

    fn source_group(&self) -> Option<&ResourceId> {
        match &self.source_security_group_id {
            Some(Token::Ref(id)) | Some(Token::GetAtt(id, _)) => Some(id),
            _ => None,
        }
    }
}

/// Origin of a connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficSource {
    /// Any host identified by address (the internet, another network)
    Address(Ipv4Addr),
    /// A workload carrying the given group
    Group(ResourceId),
}

impl SecurityGroup {
    /// Default-deny evaluation of an inbound TCP connection
    pub fn admits(&self, source: &TrafficSource, port: u16) -> bool {
        self.security_group_ingress
            .iter()
            .filter(|rule| rule.covers(port))
            .any(|rule| match source {
                TrafficSource::Group(id) => rule.source_group() == Some(id),
                TrafficSource::Address(addr) => rule
                    .cidr_ip
                    .as_deref()
                    .and_then(|cidr| cidr.parse::<Ipv4Network>().ok())
                    .map(|net| net.contains(*addr))
                    .unwrap_or(false),
            })
    }

    /// Groups named in the allow-list
    pub fn allowed_groups(&self) -> BTreeSet<ResourceId> {
        self.security_group_ingress
            .iter()
            .filter_map(|rule| rule.source_group().cloned())
            .collect()
    }

    /// Address ranges named in the allow-list
    pub fn allowed_cidrs(&self) -> Vec<&str> {
        self.security_group_ingress
            .iter()
            .filter_map(|rule| rule.cidr_ip.as_deref())
            .collect()
    }

    pub fn has_no_ingress(&self) -> bool {
        self.security_group_ingress.is_empty()
    }
}

/// Look up a declared group's record
pub fn lookup<'a>(graph: &'a ResourceGraph, id: &ResourceId) -> Option<&'a SecurityGroup> {
    match graph.get(id).map(|r| &r.kind) {
        Some(ResourceKind::SecurityGroup(group)) => Some(group),
        _ => None,
    }
}

/// Declared firewall groups
#[derive(Debug, Clone)]
pub struct SecurityBoundaries {
    pub load_balancer: ResourceRef,
    pub service: ResourceRef,
    pub bastion: ResourceRef,
    pub datastore: ResourceRef,
    /// Only when the network has no NAT
    pub endpoints: Option<ResourceRef>,
}

/// Declare every firewall group and its allow-list.
pub fn declare_boundaries(
    graph: &mut ResourceGraph,
    config: &DeploymentConfig,
    network: &Network,
) -> InfraResult<SecurityBoundaries> {
    let stack = &config.stack_name;
    let tls = config.exposure.certificate_arn.is_some();

    let mut lb_ingress = vec![IngressRule::from_cidr(
        HTTP_PORT,
        "0.0.0.0/0",
        "HTTP from anywhere",
    )];
    if tls {
        lb_ingress.push(IngressRule::from_cidr(
            HTTPS_PORT,
            "0.0.0.0/0",
            "HTTPS from anywhere",
        ));
    }
    let load_balancer = graph.declare(Declaration::new(
        "LoadBalancerSecurityGroup",
        SecurityGroup {
            group_description: format!("{} load balancer", stack),
            vpc_id: network.vpc.token(),
            security_group_ingress: lb_ingress,
            tags: vec![Tag::name(format!("{}/LoadBalancer", stack))],
        },
    ))?;

    let service = graph.declare(Declaration::new(
        "ServiceSecurityGroup",
        SecurityGroup {
            group_description: format!("{} service tasks", stack),
            vpc_id: network.vpc.token(),
            security_group_ingress: vec![IngressRule::from_group(
                config.service.container_port,
                &load_balancer,
                "Load balancer to container",
            )],
            tags: vec![Tag::name(format!("{}/Service", stack))],
        },
    ))?;

    let bastion = graph.declare(Declaration::new(
        "BastionSecurityGroup",
        SecurityGroup {
            group_description: format!("{} bastion, no inbound access", stack),
            vpc_id: network.vpc.token(),
            security_group_ingress: vec![],
            tags: vec![Tag::name(format!("{}/Bastion", stack))],
        },
    ))?;

    let port = config.datastore.port;
    let datastore = graph.declare(Declaration::new(
        "DatastoreSecurityGroup",
        SecurityGroup {
            group_description: format!("{} datastore", stack),
            vpc_id: network.vpc.token(),
            security_group_ingress: vec![
                IngressRule::from_group(port, &service, "Service to datastore"),
                IngressRule::from_group(port, &bastion, "Bastion to datastore"),
            ],
            tags: vec![Tag::name(format!("{}/Datastore", stack))],
        },
    ))?;

    let endpoints = if network.has_private_subnets() {
        None
    } else {
        Some(graph.declare(Declaration::new(
            "EndpointSecurityGroup",
            SecurityGroup {
                group_description: format!("{} private service endpoints", stack),
                vpc_id: network.vpc.token(),
                security_group_ingress: vec![
                    IngressRule::from_group(HTTPS_PORT, &service, "Service to endpoints"),
                    IngressRule::from_group(HTTPS_PORT, &bastion, "Bastion to endpoints"),
                ],
                tags: vec![Tag::name(format!("{}/Endpoints", stack))],
            },
        ))?)
    };

    tracing::info!(
        tls,
        endpoints = endpoints.is_some(),
        "declared security boundaries"
    );

    Ok(SecurityBoundaries {
        load_balancer,
        service,
        bastion,
        datastore,
        endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network;

    fn declare_for(config: &DeploymentConfig) -> (ResourceGraph, SecurityBoundaries) {
        let mut graph = ResourceGraph::new();
        let net = network::declare(&mut graph, config).unwrap();
        let sg = declare_boundaries(&mut graph, config, &net).unwrap();
        (graph, sg)
    }

    #[test]
    fn test_datastore_allow_list_is_exact() {
        for config in [DeploymentConfig::staging(), DeploymentConfig::production()] {
            let (graph, sg) = declare_for(&config);
            let db = lookup(&graph, sg.datastore.id()).unwrap();

            let expected: BTreeSet<_> = [sg.service.id().clone(), sg.bastion.id().clone()]
                .into_iter()
                .collect();
            assert_eq!(db.allowed_groups(), expected);
            assert!(db.allowed_cidrs().is_empty());

            let port = config.datastore.port;
            assert!(db.admits(&TrafficSource::Group(sg.service.id().clone()), port));
            assert!(db.admits(&TrafficSource::Group(sg.bastion.id().clone()), port));
            assert!(!db.admits(&TrafficSource::Group(sg.load_balancer.id().clone()), port));
            assert!(!db.admits(&TrafficSource::Address("203.0.113.7".parse().unwrap()), port));
            assert!(!db.admits(&TrafficSource::Address("10.0.0.10".parse().unwrap()), port));
            assert!(!db.admits(&TrafficSource::Group(sg.service.id().clone()), 22));
        }
    }

    #[test]
    fn test_bastion_has_no_ingress() {
        for config in [DeploymentConfig::staging(), DeploymentConfig::production()] {
            let (graph, sg) = declare_for(&config);
            let bastion = lookup(&graph, sg.bastion.id()).unwrap();
            assert!(bastion.has_no_ingress());
            assert!(!bastion.admits(&TrafficSource::Address("198.51.100.1".parse().unwrap()), 22));
        }
    }

    #[test]
    fn test_load_balancer_https_follows_certificate() {
        let (graph, sg) = declare_for(&DeploymentConfig::staging());
        let lb = lookup(&graph, sg.load_balancer.id()).unwrap();
        let internet = TrafficSource::Address("203.0.113.7".parse().unwrap());
        assert!(lb.admits(&internet, HTTP_PORT));
        assert!(!lb.admits(&internet, HTTPS_PORT));

        let mut config = DeploymentConfig::staging();
        config.exposure.certificate_arn =
            Some("arn:aws:acm:us-east-1:069597727371:certificate/abc".into());
        let (graph, sg) = declare_for(&config);
        let lb = lookup(&graph, sg.load_balancer.id()).unwrap();
        assert!(lb.admits(&internet, HTTPS_PORT));
    }

    #[test]
    fn test_endpoints_only_without_nat() {
        let (_, staging) = declare_for(&DeploymentConfig::staging());
        let (_, prod) = declare_for(&DeploymentConfig::production());
        assert!(staging.endpoints.is_some());
        assert!(prod.endpoints.is_none());
    }
}
