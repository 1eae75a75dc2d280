//! Resource Kinds
//!
//! Tagged union over every resource type the topology declares. Each variant
//! wraps the typed property record defined next to the component that owns
//! it and maps to the provisioning engine's type name.

use serde::{Deserialize, Serialize};

/// Key/value tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
        }
    }

    /// `Name` tag
    pub fn name(value: impl Into<String>) -> Self {
        Self::new("Name", value)
    }
}

macro_rules! resource_kinds {
    ($($variant:ident($ty:path) => $type_name:literal,)+) => {
        /// Every declarable resource type
        #[derive(Debug, Clone)]
        pub enum ResourceKind {
            $($variant($ty),)+
        }

        impl ResourceKind {
            /// Engine type name
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => $type_name,)+
                }
            }

            /// Property record rendered for the engine
            pub fn properties(&self) -> Result<serde_json::Value, serde_json::Error> {
                match self {
                    $(Self::$variant(r) => serde_json::to_value(r),)+
                }
            }
        }

        $(
            impl From<$ty> for ResourceKind {
                fn from(resource: $ty) -> Self {
                    Self::$variant(resource)
                }
            }
        )+
    };
}

resource_kinds! {
    Vpc(crate::network::Vpc) => "AWS::EC2::VPC",
    Subnet(crate::network::Subnet) => "AWS::EC2::Subnet",
    InternetGateway(crate::network::InternetGateway) => "AWS::EC2::InternetGateway",
    VpcGatewayAttachment(crate::network::VpcGatewayAttachment) => "AWS::EC2::VPCGatewayAttachment",
    RouteTable(crate::network::RouteTable) => "AWS::EC2::RouteTable",
    Route(crate::network::Route) => "AWS::EC2::Route",
    SubnetRouteTableAssociation(crate::network::SubnetRouteTableAssociation) => "AWS::EC2::SubnetRouteTableAssociation",
    Eip(crate::network::Eip) => "AWS::EC2::EIP",
    NatGateway(crate::network::NatGateway) => "AWS::EC2::NatGateway",
    VpcEndpoint(crate::network::VpcEndpoint) => "AWS::EC2::VPCEndpoint",
    SecurityGroup(crate::security::SecurityGroup) => "AWS::EC2::SecurityGroup",
    Cluster(crate::cluster::Cluster) => "AWS::ECS::Cluster",
    LogGroup(crate::service::LogGroup) => "AWS::Logs::LogGroup",
    TaskDefinition(crate::service::TaskDefinition) => "AWS::ECS::TaskDefinition",
    EcsService(crate::service::EcsService) => "AWS::ECS::Service",
    LoadBalancer(crate::exposure::LoadBalancer) => "AWS::ElasticLoadBalancingV2::LoadBalancer",
    TargetGroup(crate::exposure::TargetGroup) => "AWS::ElasticLoadBalancingV2::TargetGroup",
    Listener(crate::exposure::Listener) => "AWS::ElasticLoadBalancingV2::Listener",
    Role(crate::iam::Role) => "AWS::IAM::Role",
    InstanceProfile(crate::iam::InstanceProfile) => "AWS::IAM::InstanceProfile",
    Function(crate::function::Function) => "AWS::Lambda::Function",
    EventRule(crate::function::EventRule) => "AWS::Events::Rule",
    LambdaPermission(crate::function::LambdaPermission) => "AWS::Lambda::Permission",
    Secret(crate::datastore::Secret) => "AWS::SecretsManager::Secret",
    SecretTargetAttachment(crate::datastore::SecretTargetAttachment) => "AWS::SecretsManager::SecretTargetAttachment",
    DbSubnetGroup(crate::datastore::DbSubnetGroup) => "AWS::RDS::DBSubnetGroup",
    DbCluster(crate::datastore::DbCluster) => "AWS::RDS::DBCluster",
    DbInstance(crate::datastore::DbInstance) => "AWS::RDS::DBInstance",
    Instance(crate::bastion::Instance) => "AWS::EC2::Instance",
    ScalableTarget(crate::scaling::ScalableTarget) => "AWS::ApplicationAutoScaling::ScalableTarget",
    ScalingPolicy(crate::scaling::ScalingPolicy) => "AWS::ApplicationAutoScaling::ScalingPolicy",
}
