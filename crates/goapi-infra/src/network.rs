//! Network Topology
//!
//! Address space, availability-zone-replicated subnets, gateways and routes.
//! Subnet CIDRs are planned up front so an oversized request fails before
//! any resource is declared.

use crate::config::{DeploymentConfig, NetworkConfig, SubnetMode};
use crate::error::{InfraError, InfraResult};
use crate::graph::{Declaration, ResourceGraph, ResourceRef, Token};
use crate::resources::Tag;
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Longest subnet prefix the provider accepts
const MAX_SUBNET_PREFIX: u8 = 28;
/// Widest address range a VPC may hold
const MIN_VPC_PREFIX: u8 = 16;
/// Upper bound on zones per region
const MAX_AZS: u8 = 6;

// =============================================================================
// Resource records
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Vpc {
    pub cidr_block: String,
    pub enable_dns_hostnames: bool,
    pub enable_dns_support: bool,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subnet {
    pub vpc_id: Token,
    pub cidr_block: String,
    pub availability_zone: String,
    pub map_public_ip_on_launch: bool,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InternetGateway {
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VpcGatewayAttachment {
    pub vpc_id: Token,
    pub internet_gateway_id: Token,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteTable {
    pub vpc_id: Token,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Route {
    pub route_table_id: Token,
    pub destination_cidr_block: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nat_gateway_id: Option<Token>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubnetRouteTableAssociation {
    pub route_table_id: Token,
    pub subnet_id: Token,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Eip {
    pub domain: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NatGateway {
    pub subnet_id: Token,
    pub allocation_id: Token,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VpcEndpoint {
    pub service_name: String,
    pub vpc_id: Token,
    pub vpc_endpoint_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<Token>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<Token>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub route_table_ids: Vec<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_dns_enabled: Option<bool>,
}

// =============================================================================
// Subnet planning
// =============================================================================

/// Subnet tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetKind {
    Public,
    Private,
}

impl SubnetKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Public => "Public",
            Self::Private => "Private",
        }
    }
}

/// One planned subnet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubnet {
    pub kind: SubnetKind,
    pub availability_zone: String,
    pub cidr: Ipv4Network,
}

/// Address plan for the whole network
#[derive(Debug, Clone)]
pub struct SubnetPlan {
    pub vpc: Ipv4Network,
    pub subnets: Vec<PlannedSubnet>,
}

impl SubnetPlan {
    pub fn of_kind(&self, kind: SubnetKind) -> impl Iterator<Item = &PlannedSubnet> {
        self.subnets.iter().filter(move |s| s.kind == kind)
    }

    /// Check that every subnet fits the range and no two overlap
    pub fn verify(&self) -> InfraResult<()> {
        for (i, a) in self.subnets.iter().enumerate() {
            if !a.cidr.is_subnet_of(self.vpc) {
                return Err(InfraError::InvalidCidr {
                    cidr: a.cidr.to_string(),
                    reason: format!("outside address range {}", self.vpc),
                });
            }
            for b in &self.subnets[i + 1..] {
                if a.cidr.overlaps(b.cidr) {
                    return Err(InfraError::InvalidCidr {
                        cidr: b.cidr.to_string(),
                        reason: format!("overlaps {}", a.cidr),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parse a network CIDR. Host bits must be zero.
pub fn parse_cidr(cidr: &str) -> InfraResult<Ipv4Network> {
    let net: Ipv4Network = cidr.parse().map_err(|e| InfraError::InvalidCidr {
        cidr: cidr.to_string(),
        reason: format!("{}", e),
    })?;
    if net.ip() != net.network() {
        return Err(InfraError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: format!("host bits set; did you mean {}/{}?", net.network(), net.prefix()),
        });
    }
    Ok(net)
}

/// Availability zone name for index `i` (`us-east-1a`, `us-east-1b`, ...)
pub fn availability_zone(region: &str, i: usize) -> String {
    format!("{}{}", region, (b'a' + i as u8) as char)
}

/// Carve the address range into one public subnet per zone, followed by one
/// private subnet per zone when the mode asks for them.
pub fn plan_subnets(network: &NetworkConfig, region: &str) -> InfraResult<SubnetPlan> {
    let vpc = parse_cidr(&network.cidr)?;
    if !(MIN_VPC_PREFIX..=MAX_SUBNET_PREFIX).contains(&vpc.prefix()) {
        return Err(InfraError::InvalidCidr {
            cidr: network.cidr.clone(),
            reason: format!(
                "address range must be /{} to /{}",
                MIN_VPC_PREFIX, MAX_SUBNET_PREFIX
            ),
        });
    }

    if network.max_azs == 0 || network.max_azs > MAX_AZS {
        return Err(InfraError::InvalidConfig(format!(
            "max_azs must be between 1 and {}, got {}",
            MAX_AZS, network.max_azs
        )));
    }
    if network.subnet_prefix > MAX_SUBNET_PREFIX {
        return Err(InfraError::InvalidConfig(format!(
            "subnet prefix /{} is longer than /{}",
            network.subnet_prefix, MAX_SUBNET_PREFIX
        )));
    }

    let kinds: &[SubnetKind] = match network.subnet_mode {
        SubnetMode::PublicOnly => &[SubnetKind::Public],
        SubnetMode::PublicAndPrivate => &[SubnetKind::Public, SubnetKind::Private],
    };
    let requested = kinds.len() * usize::from(network.max_azs);

    let exhausted = || InfraError::AddressSpaceExhausted {
        vpc: vpc.to_string(),
        requested,
        prefix: network.subnet_prefix,
    };
    if network.subnet_prefix < vpc.prefix() {
        return Err(exhausted());
    }
    let invalid_subnet = |addr: Ipv4Addr, e: ipnetwork::IpNetworkError| InfraError::InvalidCidr {
        cidr: format!("{}/{}", addr, network.subnet_prefix),
        reason: format!("{}", e),
    };
    let step = Ipv4Network::new(vpc.network(), network.subnet_prefix)
        .map_err(|e| invalid_subnet(vpc.network(), e))?
        .size();
    if requested as u64 * u64::from(step) > u64::from(vpc.size()) {
        return Err(exhausted());
    }

    let mut subnets = Vec::with_capacity(requested);
    for (group, kind) in kinds.iter().enumerate() {
        for az in 0..usize::from(network.max_azs) {
            let offset = (group * usize::from(network.max_azs) + az) as u32 * step;
            let addr = vpc.nth(offset).ok_or_else(exhausted)?;
            let cidr = Ipv4Network::new(addr, network.subnet_prefix)
                .map_err(|e| invalid_subnet(addr, e))?;
            subnets.push(PlannedSubnet {
                kind: *kind,
                availability_zone: availability_zone(region, az),
                cidr,
            });
        }
    }

    let plan = SubnetPlan { vpc, subnets };
    plan.verify()?;
    Ok(plan)
}

// =============================================================================
// Declaration
// =============================================================================

/// Declared subnet and its route table
#[derive(Debug, Clone)]
pub struct SubnetHandle {
    pub subnet: ResourceRef,
    pub route_table: ResourceRef,
    pub planned: PlannedSubnet,
}

/// Declared network
#[derive(Debug, Clone)]
pub struct Network {
    pub vpc: ResourceRef,
    pub internet_gateway: ResourceRef,
    pub public_subnets: Vec<SubnetHandle>,
    pub private_subnets: Vec<SubnetHandle>,
    pub nat_gateways: Vec<ResourceRef>,
    pub plan: SubnetPlan,
}

impl Network {
    pub fn has_private_subnets(&self) -> bool {
        !self.private_subnets.is_empty()
    }

    /// Subnets for workloads that must not face the internet: private when
    /// they exist, public otherwise.
    pub fn workload_subnets(&self) -> &[SubnetHandle] {
        if self.has_private_subnets() {
            &self.private_subnets
        } else {
            &self.public_subnets
        }
    }

    pub fn subnet_tokens(subnets: &[SubnetHandle]) -> Vec<Token> {
        subnets.iter().map(|s| s.subnet.token()).collect()
    }
}

/// Declare the address space, subnets, gateways and routes.
pub fn declare(graph: &mut ResourceGraph, config: &DeploymentConfig) -> InfraResult<Network> {
    let plan = plan_subnets(&config.network, &config.region)?;
    let stack = &config.stack_name;

    tracing::info!(
        cidr = %plan.vpc,
        azs = config.network.max_azs,
        mode = ?config.network.subnet_mode,
        subnets = plan.subnets.len(),
        "declaring network topology"
    );

    let vpc = graph.declare(Declaration::new(
        "Vpc",
        Vpc {
            cidr_block: plan.vpc.to_string(),
            enable_dns_hostnames: true,
            enable_dns_support: true,
            tags: vec![Tag::name(format!("{}/Vpc", stack))],
        },
    ))?;

    let internet_gateway = graph.declare(Declaration::new(
        "VpcInternetGateway",
        InternetGateway {
            tags: vec![Tag::name(format!("{}/Vpc", stack))],
        },
    ))?;
    let attachment = graph.declare(Declaration::new(
        "VpcGatewayAttachment",
        VpcGatewayAttachment {
            vpc_id: vpc.token(),
            internet_gateway_id: internet_gateway.token(),
        },
    ))?;

    let mut public_subnets = Vec::new();
    for (i, planned) in plan.of_kind(SubnetKind::Public).enumerate() {
        let handle = declare_subnet(graph, stack, &vpc, planned, i + 1)?;
        graph.declare(
            Declaration::new(
                format!("VpcPublicSubnet{}DefaultRoute", i + 1),
                Route {
                    route_table_id: handle.route_table.token(),
                    destination_cidr_block: "0.0.0.0/0".into(),
                    gateway_id: Some(internet_gateway.token()),
                    nat_gateway_id: None,
                },
            )
            .depends_on(&attachment),
        )?;
        public_subnets.push(handle);
    }

    let mut nat_gateways = Vec::new();
    let mut private_subnets = Vec::new();
    for (i, planned) in plan.of_kind(SubnetKind::Private).enumerate() {
        let public = &public_subnets[i];
        let eip = graph.declare(Declaration::new(
            format!("VpcPublicSubnet{}Eip", i + 1),
            Eip {
                domain: "vpc".into(),
                tags: vec![Tag::name(format!("{}/Vpc/PublicSubnet{}", stack, i + 1))],
            },
        ))?;
        let nat = graph.declare(Declaration::new(
            format!("VpcPublicSubnet{}NatGateway", i + 1),
            NatGateway {
                subnet_id: public.subnet.token(),
                allocation_id: eip.attr("AllocationId"),
                tags: vec![Tag::name(format!("{}/Vpc/PublicSubnet{}", stack, i + 1))],
            },
        ))?;

        let handle = declare_subnet(graph, stack, &vpc, planned, i + 1)?;
        graph.declare(Declaration::new(
            format!("VpcPrivateSubnet{}DefaultRoute", i + 1),
            Route {
                route_table_id: handle.route_table.token(),
                destination_cidr_block: "0.0.0.0/0".into(),
                gateway_id: None,
                nat_gateway_id: Some(nat.token()),
            },
        ))?;
        nat_gateways.push(nat);
        private_subnets.push(handle);
    }

    Ok(Network {
        vpc,
        internet_gateway,
        public_subnets,
        private_subnets,
        nat_gateways,
        plan,
    })
}

fn declare_subnet(
    graph: &mut ResourceGraph,
    stack: &str,
    vpc: &ResourceRef,
    planned: &PlannedSubnet,
    ordinal: usize,
) -> InfraResult<SubnetHandle> {
    let name = format!("Vpc{}Subnet{}", planned.kind.label(), ordinal);
    let tag = format!("{}/Vpc/{}Subnet{}", stack, planned.kind.label(), ordinal);

    let subnet = graph.declare(Declaration::new(
        name.clone(),
        Subnet {
            vpc_id: vpc.token(),
            cidr_block: planned.cidr.to_string(),
            availability_zone: planned.availability_zone.clone(),
            map_public_ip_on_launch: false,
            tags: vec![
                Tag::name(tag.clone()),
                Tag::new("subnet-type", planned.kind.label()),
            ],
        },
    ))?;
    let route_table = graph.declare(Declaration::new(
        format!("{}RouteTable", name),
        RouteTable {
            vpc_id: vpc.token(),
            tags: vec![Tag::name(tag)],
        },
    ))?;
    graph.declare(Declaration::new(
        format!("{}RouteTableAssociation", name),
        SubnetRouteTableAssociation {
            route_table_id: route_table.token(),
            subnet_id: subnet.token(),
        },
    ))?;

    Ok(SubnetHandle {
        subnet,
        route_table,
        planned: planned.clone(),
    })
}

/// Interface endpoints the workloads need when they have no route to the
/// internet: image pulls, logs, secrets, the session broker, and the
/// scheduled warm-up rules.
pub const INTERFACE_ENDPOINTS: &[(&str, &str)] = &[
    ("EcrApi", "ecr.api"),
    ("EcrDocker", "ecr.dkr"),
    ("Logs", "logs"),
    ("SecretsManager", "secretsmanager"),
    ("Ssm", "ssm"),
    ("SsmMessages", "ssmmessages"),
    ("Ec2Messages", "ec2messages"),
    ("Events", "events"),
];

/// Declare private endpoints for a network without NAT. The S3 gateway
/// endpoint carries image layers; interface endpoints sit in the public
/// subnets behind `endpoint_group`.
pub fn declare_endpoints(
    graph: &mut ResourceGraph,
    config: &DeploymentConfig,
    network: &Network,
    endpoint_group: &ResourceRef,
) -> InfraResult<Vec<ResourceRef>> {
    tracing::info!(
        interface = INTERFACE_ENDPOINTS.len(),
        "network has no NAT, declaring private service endpoints"
    );

    let mut endpoints = Vec::new();
    endpoints.push(graph.declare(Declaration::new(
        "VpcS3Endpoint",
        VpcEndpoint {
            service_name: format!("com.amazonaws.{}.s3", config.region),
            vpc_id: network.vpc.token(),
            vpc_endpoint_type: "Gateway".into(),
            subnet_ids: vec![],
            security_group_ids: vec![],
            route_table_ids: network
                .public_subnets
                .iter()
                .chain(network.private_subnets.iter())
                .map(|s| s.route_table.token())
                .collect(),
            private_dns_enabled: None,
        },
    ))?);

    for (name, service) in INTERFACE_ENDPOINTS {
        endpoints.push(graph.declare(Declaration::new(
            format!("Vpc{}Endpoint", name),
            VpcEndpoint {
                service_name: format!("com.amazonaws.{}.{}", config.region, service),
                vpc_id: network.vpc.token(),
                vpc_endpoint_type: "Interface".into(),
                subnet_ids: Network::subnet_tokens(network.workload_subnets()),
                security_group_ids: vec![endpoint_group.token()],
                route_table_ids: vec![],
                private_dns_enabled: Some(true),
            },
        ))?);
    }

    Ok(endpoints)
}
