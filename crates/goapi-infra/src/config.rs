//! Deployment Configuration
//!
//! One parameterized configuration drives both environment variants. The
//! staging and production presets differ only in values, never in code
//! paths, so the two topologies cannot drift apart.

use crate::error::{InfraError, InfraResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

/// Complete deployment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Stack name passed to the provisioning engine
    pub stack_name: String,
    pub environment: Environment,
    pub region: String,
    pub account_id: String,
    pub network: NetworkConfig,
    pub service: ServiceConfig,
    pub exposure: ExposureConfig,
    pub datastore: DatastoreConfig,
    pub bastion: BastionConfig,
    pub function: FunctionConfig,
    pub permissions: PermissionsConfig,
    /// Present only in production
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingConfig>,
}

/// Subnet partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetMode {
    /// Zero private subnets: no NAT infrastructure
    PublicOnly,
    PublicAndPrivate,
}

/// Network topology configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address range of the network
    pub cidr: String,
    /// Availability zones to spread subnets across
    pub max_azs: u8,
    /// Prefix length of every subnet
    pub subnet_prefix: u8,
    pub subnet_mode: SubnetMode,
}

/// Container service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// CPU units (1024 = one vCPU)
    pub cpu: u32,
    pub memory_mib: u32,
    pub desired_count: u32,
    /// Registry image URI (`registry/repository:tag`)
    pub image: String,
    pub container_port: u16,
    /// Path the application answers with 200 when alive
    pub liveness_path: String,
    /// Off unless explicitly required
    #[serde(default)]
    pub assign_public_ip: bool,
    pub log_retention_days: u32,
    pub health_check_grace_secs: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Env var name -> secret name (under the app secret prefix)
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

/// Load balancer health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub path: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

/// Exposure layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureConfig {
    /// TLS certificate; absent means plain HTTP only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_arn: Option<String>,
    pub deregistration_delay_secs: u32,
    pub health_check: HealthCheckConfig,
}

/// Datastore configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreConfig {
    pub engine_version: String,
    pub database_name: String,
    pub master_username: String,
    /// Database user the workloads connect as through IAM auth
    pub iam_user: String,
    pub port: u16,
    /// Serverless capacity range in ACUs
    pub min_capacity: f64,
    pub max_capacity: f64,
    pub backup_retention_days: u32,
    pub deletion_protection: bool,
}

/// Operator access path configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionConfig {
    pub instance_type: String,
    /// SSM parameter holding the machine image id
    pub image_parameter: String,
}

/// Auxiliary function configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub code_bucket: String,
    pub code_key: String,
    pub memory_mib: u32,
    pub timeout_secs: u32,
    pub log_retention_days: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub trigger: TriggerConfig,
}

/// Event rule invoking the function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub rule_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_pattern: Option<serde_json::Value>,
}

/// Naming patterns the service's grants are scoped to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Secret-name prefix the workloads may read
    pub secret_prefix: String,
    /// Event-rule-name prefix the service may manage
    pub event_rule_prefix: String,
}

/// Target-tracking scaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub target_cpu_percent: f64,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub scale_in_cooldown_secs: u64,
    pub scale_out_cooldown_secs: u64,
    /// Consecutive samples that must agree before an adjustment
    pub sustain_samples: usize,
}

const ECR_IMAGE: &str = "069597727371.dkr.ecr.us-east-1.amazonaws.com/go-api:latest";

impl DeploymentConfig {
    /// Staging preset: two AZs, public subnets only, no autoscaling,
    /// disposable datastore.
    pub fn staging() -> Self {
        Self {
            stack_name: "GoApiInfraStack".into(),
            environment: Environment::Staging,
            region: "us-east-1".into(),
            account_id: "069597727371".into(),
            network: NetworkConfig {
                cidr: "10.0.0.0/16".into(),
                max_azs: 2,
                subnet_prefix: 24,
                subnet_mode: SubnetMode::PublicOnly,
            },
            service: ServiceConfig {
                name: "go-api".into(),
                cpu: 256,
                memory_mib: 512,
                desired_count: 1,
                image: ECR_IMAGE.into(),
                container_port: 8080,
                liveness_path: "/api/healthcheck".into(),
                assign_public_ip: false,
                log_retention_days: 7,
                health_check_grace_secs: 60,
                environment: BTreeMap::from([("APP_ENV".to_string(), "staging".to_string())]),
                secrets: BTreeMap::new(),
            },
            exposure: ExposureConfig {
                certificate_arn: None,
                deregistration_delay_secs: 30,
                health_check: HealthCheckConfig {
                    path: "/api/healthcheck".into(),
                    interval_secs: 30,
                    timeout_secs: 5,
                    healthy_threshold: 2,
                    unhealthy_threshold: 5,
                },
            },
            datastore: DatastoreConfig {
                engine_version: "15.4".into(),
                database_name: "goapi".into(),
                master_username: "goapi_admin".into(),
                iam_user: "goapi_app".into(),
                port: 5432,
                min_capacity: 0.5,
                max_capacity: 2.0,
                backup_retention_days: 1,
                deletion_protection: false,
            },
            bastion: BastionConfig {
                instance_type: "t3.nano".into(),
                image_parameter: "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64"
                    .into(),
            },
            function: FunctionConfig {
                name: "go-api-event-notifier".into(),
                runtime: "python3.12".into(),
                handler: "index.handler".into(),
                code_bucket: "go-api-artifacts".into(),
                code_key: "lambda/event-notifier.zip".into(),
                memory_mib: 128,
                timeout_secs: 30,
                log_retention_days: 7,
                environment: BTreeMap::new(),
                trigger: TriggerConfig {
                    rule_name: "go-api-deployment-events".into(),
                    schedule: None,
                    event_pattern: Some(serde_json::json!({
                        "source": ["aws.ecs"],
                        "detail-type": ["ECS Deployment State Change"],
                    })),
                },
            },
            permissions: PermissionsConfig {
                secret_prefix: "go-api/".into(),
                event_rule_prefix: "go-api-".into(),
            },
            scaling: None,
        }
    }

    /// Production preset: three AZs with private subnets behind NAT, two
    /// replicas under CPU target tracking, protected datastore.
    pub fn production() -> Self {
        let mut config = Self::staging();
        config.stack_name = "GoApiProdInfraStack".into();
        config.environment = Environment::Production;
        config.network.max_azs = 3;
        config.network.subnet_mode = SubnetMode::PublicAndPrivate;
        config.service.cpu = 512;
        config.service.memory_mib = 1024;
        config.service.desired_count = 2;
        config.service.log_retention_days = 30;
        config
            .service
            .environment
            .insert("APP_ENV".into(), "production".into());
        config.function.log_retention_days = 30;
        config.datastore.max_capacity = 8.0;
        config.datastore.backup_retention_days = 14;
        config.datastore.deletion_protection = true;
        config.scaling = Some(ScalingConfig {
            target_cpu_percent: 50.0,
            min_replicas: 2,
            max_replicas: 5,
            scale_in_cooldown_secs: 60,
            scale_out_cooldown_secs: 60,
            sustain_samples: 3,
        });
        config
    }

    /// Preset for an environment
    pub fn preset(environment: Environment) -> Self {
        match environment {
            Environment::Staging => Self::staging(),
            Environment::Production => Self::production(),
        }
    }

    /// Parse from TOML
    pub fn from_toml_str(content: &str) -> InfraResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> InfraResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from file
    pub fn load(path: &Path) -> InfraResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save to file
    pub fn save(&self, path: &Path) -> InfraResult<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Stack-wide checks; component checks live with each component.
    pub fn validate(&self) -> InfraResult<()> {
        if self.stack_name.is_empty()
            || !self
                .stack_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(InfraError::InvalidConfig(format!(
                "stack name `{}` must be non-empty alphanumerics or hyphens",
                self.stack_name
            )));
        }
        if self.region.is_empty() {
            return Err(InfraError::InvalidConfig("region is empty".into()));
        }
        if self.account_id.len() != 12 || !self.account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(InfraError::InvalidConfig(format!(
                "account id `{}` must be 12 digits",
                self.account_id
            )));
        }
        if self.scaling.is_some() && !self.environment.is_production() {
            tracing::warn!(
                environment = self.environment.as_str(),
                "scaling controller declared outside production"
            );
        }
        Ok(())
    }

    /// `arn:aws:<service>:<region>:<account>:<resource>`
    pub fn arn(&self, service: &str, resource: &str) -> String {
        format!(
            "arn:aws:{}:{}:{}:{}",
            service, self.region, self.account_id, resource
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_differ_only_in_values() {
        let staging = DeploymentConfig::staging();
        let prod = DeploymentConfig::production();

        assert_eq!(staging.network.subnet_mode, SubnetMode::PublicOnly);
        assert_eq!(prod.network.subnet_mode, SubnetMode::PublicAndPrivate);
        assert!(staging.scaling.is_none());
        assert!(prod.scaling.is_some());
        assert!(prod.datastore.deletion_protection);
        assert!(!staging.datastore.deletion_protection);
        assert_eq!(staging.service.liveness_path, prod.service.liveness_path);
        assert!(!prod.service.assign_public_ip);
    }

    #[test]
    fn test_toml_roundtrip_preserves_preset() {
        let prod = DeploymentConfig::production();
        let text = prod.to_toml_string().unwrap();
        let parsed = DeploymentConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, prod);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        DeploymentConfig::staging().save(&path).unwrap();

        let loaded = DeploymentConfig::load(&path).unwrap();
        assert_eq!(loaded.stack_name, "GoApiInfraStack");
    }

    #[test]
    fn test_rejects_bad_account() {
        let mut config = DeploymentConfig::staging();
        config.account_id = "12345".into();
        assert!(matches!(config.validate(), Err(InfraError::InvalidConfig(_))));
    }

    #[test]
    fn test_arn_format() {
        let config = DeploymentConfig::staging();
        assert_eq!(
            config.arn("ecr", "repository/go-api"),
            "arn:aws:ecr:us-east-1:069597727371:repository/go-api"
        );
    }
}
