//! Error types for topology declaration

use crate::graph::ResourceId;
use thiserror::Error;

/// Declaration-time error. Every variant is fatal and is raised before the
/// provisioning engine is invoked.
#[derive(Error, Debug)]
pub enum InfraError {
    /// Configuration value out of range or inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Logical id declared twice
    #[error("resource `{0}` is already declared")]
    DuplicateResource(ResourceId),

    /// Reference to a resource that has not been declared yet
    #[error("resource `{resource}` references undeclared resource `{target}`")]
    UnknownReference {
        resource: ResourceId,
        target: ResourceId,
    },

    /// Unparseable address range
    #[error("invalid CIDR `{cidr}`: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    /// Subnet request does not fit the address range
    #[error("address space {vpc} cannot hold {requested} subnets of /{prefix}")]
    AddressSpaceExhausted {
        vpc: String,
        requested: usize,
        prefix: u8,
    },

    /// Action or resource pattern is not well-formed
    #[error("malformed permission: {0}")]
    MalformedPermission(String),

    /// Resource pattern wider than the action allows
    #[error("grant of `{action}` on `{resource}` is broader than the action requires")]
    OverBroadGrant { action: String, resource: String },

    /// Load balancer would probe a path the service does not answer
    #[error("health check path `{configured}` does not match liveness endpoint `{liveness}`")]
    HealthCheckMismatch { configured: String, liveness: String },

    /// Scaling bounds or target out of range
    #[error("invalid scaling policy: {0}")]
    InvalidScaling(String),

    /// Production datastore without durability settings
    #[error("production datastore requires {0}")]
    DurabilityRequired(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config file could not be parsed
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Config could not be written
    #[error("config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for topology declaration
pub type InfraResult<T> = Result<T, InfraError>;
