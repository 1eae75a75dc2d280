//! Datastore
//!
//! Aurora PostgreSQL with serverless v2 capacity. Credentials are generated
//! into a secret and resolved by the engine; workloads connect with IAM
//! authentication as a dedicated database user.

use crate::config::{DatastoreConfig, DeploymentConfig};
use crate::error::{InfraError, InfraResult};
use crate::graph::{DeletionPolicy, Declaration, ResourceGraph, ResourceRef, Token};
use crate::network::Network;
use crate::resources::Tag;
use crate::security::SecurityBoundaries;
use serde::Serialize;

const ENGINE: &str = "aurora-postgresql";
const MIN_ACU: f64 = 0.5;
const MAX_ACU: f64 = 128.0;
/// Shortest retention accepted for a production datastore
const PRODUCTION_MIN_RETENTION_DAYS: u32 = 7;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Secret {
    pub name: String,
    pub description: String,
    pub generate_secret_string: GenerateSecretString,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GenerateSecretString {
    pub secret_string_template: String,
    pub generate_string_key: String,
    pub password_length: u32,
    pub exclude_characters: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecretTargetAttachment {
    pub secret_id: Token,
    pub target_id: Token,
    pub target_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbSubnetGroup {
    #[serde(rename = "DBSubnetGroupDescription")]
    pub description: String,
    #[serde(rename = "SubnetIds")]
    pub subnet_ids: Vec<Token>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DbCluster {
    pub engine: String,
    pub engine_version: String,
    pub database_name: String,
    pub port: u16,
    pub master_username: String,
    pub master_user_password: Token,
    #[serde(rename = "DBSubnetGroupName")]
    pub db_subnet_group_name: Token,
    pub vpc_security_group_ids: Vec<Token>,
    pub serverless_v2_scaling_configuration: ServerlessV2Scaling,
    #[serde(rename = "EnableIAMDatabaseAuthentication")]
    pub enable_iam_database_authentication: bool,
    pub storage_encrypted: bool,
    pub backup_retention_period: u32,
    pub deletion_protection: bool,
    pub copy_tags_to_snapshot: bool,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerlessV2Scaling {
    pub min_capacity: f64,
    pub max_capacity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbInstance {
    #[serde(rename = "DBClusterIdentifier")]
    pub db_cluster_identifier: Token,
    #[serde(rename = "DBInstanceClass")]
    pub db_instance_class: String,
    #[serde(rename = "Engine")]
    pub engine: String,
    #[serde(rename = "PubliclyAccessible")]
    pub publicly_accessible: bool,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

fn is_capacity_step(acu: f64) -> bool {
    (acu * 2.0).fract() == 0.0
}

/// Validate the datastore against engine limits and the environment's
/// durability requirements.
pub fn validate(config: &DeploymentConfig) -> InfraResult<()> {
    let db = &config.datastore;

    for (label, acu) in [("minimum", db.min_capacity), ("maximum", db.max_capacity)] {
        if !(MIN_ACU..=MAX_ACU).contains(&acu) || !is_capacity_step(acu) {
            return Err(InfraError::InvalidConfig(format!(
                "{} capacity {} ACU must be {}-{} in 0.5 steps",
                label, acu, MIN_ACU, MAX_ACU
            )));
        }
    }
    if db.min_capacity > db.max_capacity {
        return Err(InfraError::InvalidConfig(format!(
            "capacity range {}-{} ACU is inverted",
            db.min_capacity, db.max_capacity
        )));
    }
    for (label, name) in [
        ("database name", &db.database_name),
        ("master username", &db.master_username),
        ("IAM user", &db.iam_user),
    ] {
        if !is_identifier(name) {
            return Err(InfraError::InvalidConfig(format!(
                "{} `{}` is not a valid identifier",
                label, name
            )));
        }
    }
    if !(1..=35).contains(&db.backup_retention_days) {
        return Err(InfraError::InvalidConfig(format!(
            "backup retention {} days outside 1-35",
            db.backup_retention_days
        )));
    }
    if db.port == 0 {
        return Err(InfraError::InvalidConfig("datastore port must be non-zero".into()));
    }

    if config.environment.is_production() {
        if !db.deletion_protection {
            return Err(InfraError::DurabilityRequired(
                "deletion protection must be enabled".into(),
            ));
        }
        if db.backup_retention_days < PRODUCTION_MIN_RETENTION_DAYS {
            return Err(InfraError::DurabilityRequired(format!(
                "backup retention must be at least {} days, got {}",
                PRODUCTION_MIN_RETENTION_DAYS, db.backup_retention_days
            )));
        }
    }
    Ok(())
}

/// What happens to the data when the cluster is removed
pub fn deletion_policy(db: &DatastoreConfig) -> DeletionPolicy {
    if db.deletion_protection {
        DeletionPolicy::Snapshot
    } else {
        DeletionPolicy::Delete
    }
}

/// Declared datastore
#[derive(Debug, Clone)]
pub struct Datastore {
    pub secret: ResourceRef,
    pub subnet_group: ResourceRef,
    pub cluster: ResourceRef,
    pub instance: ResourceRef,
    /// `rds-db:connect` resource for the workload's database user
    pub db_user_arn: Token,
}

impl Datastore {
    /// Writer endpoint host name
    pub fn endpoint(&self) -> Token {
        self.cluster.attr("Endpoint.Address")
    }
}

pub fn declare(
    graph: &mut ResourceGraph,
    config: &DeploymentConfig,
    network: &Network,
    boundaries: &SecurityBoundaries,
) -> InfraResult<Datastore> {
    validate(config)?;
    let db = &config.datastore;
    let policy = deletion_policy(db);

    tracing::info!(
        engine = ENGINE,
        version = %db.engine_version,
        min_acu = db.min_capacity,
        max_acu = db.max_capacity,
        private = network.has_private_subnets(),
        policy = ?policy,
        "declaring datastore"
    );

    let secret = graph.declare(
        Declaration::new(
            "DatastoreSecret",
            Secret {
                name: format!(
                    "{}{}/datastore",
                    config.permissions.secret_prefix,
                    config.environment.as_str()
                ),
                description: format!("{} datastore credentials", config.stack_name),
                generate_secret_string: GenerateSecretString {
                    secret_string_template: serde_json::json!({ "username": db.master_username })
                        .to_string(),
                    generate_string_key: "password".into(),
                    password_length: 32,
                    exclude_characters: "\"@/\\ '".into(),
                },
                tags: vec![Tag::new("environment", config.environment.as_str())],
            },
        )
        // secrets cannot be snapshotted
        .deletion_policy(match policy {
            DeletionPolicy::Delete => DeletionPolicy::Delete,
            _ => DeletionPolicy::Retain,
        }),
    )?;

    let subnet_group = graph.declare(Declaration::new(
        "DatastoreSubnetGroup",
        DbSubnetGroup {
            description: format!("{} datastore placement", config.stack_name),
            subnet_ids: Network::subnet_tokens(network.workload_subnets()),
        },
    ))?;

    let cluster = graph.declare(
        Declaration::new(
            "DatastoreCluster",
            DbCluster {
                engine: ENGINE.into(),
                engine_version: db.engine_version.clone(),
                database_name: db.database_name.clone(),
                port: db.port,
                master_username: db.master_username.clone(),
                master_user_password: Token::join([
                    Token::literal("{{resolve:secretsmanager:"),
                    secret.token(),
                    Token::literal(":SecretString:password}}"),
                ]),
                db_subnet_group_name: subnet_group.token(),
                vpc_security_group_ids: vec![boundaries.datastore.attr("GroupId")],
                serverless_v2_scaling_configuration: ServerlessV2Scaling {
                    min_capacity: db.min_capacity,
                    max_capacity: db.max_capacity,
                },
                enable_iam_database_authentication: true,
                storage_encrypted: true,
                backup_retention_period: db.backup_retention_days,
                deletion_protection: db.deletion_protection,
                copy_tags_to_snapshot: true,
                tags: vec![Tag::name(format!("{}/Datastore", config.stack_name))],
            },
        )
        .deletion_policy(policy),
    )?;

    let instance = graph.declare(Declaration::new(
        "DatastoreWriter",
        DbInstance {
            db_cluster_identifier: cluster.token(),
            db_instance_class: "db.serverless".into(),
            engine: ENGINE.into(),
            publicly_accessible: false,
        },
    ))?;

    graph.declare(Declaration::new(
        "DatastoreSecretAttachment",
        SecretTargetAttachment {
            secret_id: secret.token(),
            target_id: cluster.token(),
            target_type: "AWS::RDS::DBCluster".into(),
        },
    ))?;

    let db_user_arn = Token::join([
        Token::Literal(config.arn("rds-db", "dbuser:")),
        cluster.attr("DBClusterResourceId"),
        Token::Literal(format!("/{}", db.iam_user)),
    ]);

    Ok(Datastore {
        secret,
        subnet_group,
        cluster,
        instance,
        db_user_arn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{network, security};

    fn declare_for(config: &DeploymentConfig) -> InfraResult<(ResourceGraph, Network, Datastore)> {
        let mut graph = ResourceGraph::new();
        let net = network::declare(&mut graph, config)?;
        let sg = security::declare_boundaries(&mut graph, config, &net)?;
        let ds = declare(&mut graph, config, &net, &sg)?;
        Ok((graph, net, ds))
    }

    #[test]
    fn test_never_publicly_accessible() {
        for config in [DeploymentConfig::staging(), DeploymentConfig::production()] {
            let (graph, _, ds) = declare_for(&config).unwrap();
            let props = &graph.get(ds.instance.id()).unwrap().properties;
            assert_eq!(props["PubliclyAccessible"], false);
            assert_eq!(props["DBInstanceClass"], "db.serverless");
        }
    }

    #[test]
    fn test_subnet_group_follows_mode() {
        let (graph, net, ds) = declare_for(&DeploymentConfig::production()).unwrap();
        let group = graph.get(ds.subnet_group.id()).unwrap();
        for handle in &net.private_subnets {
            assert!(group.references.contains(handle.subnet.id()));
        }
        for handle in &net.public_subnets {
            assert!(!group.references.contains(handle.subnet.id()));
        }

        let (graph, net, ds) = declare_for(&DeploymentConfig::staging()).unwrap();
        let group = graph.get(ds.subnet_group.id()).unwrap();
        assert_eq!(group.references.len(), net.public_subnets.len());
    }

    #[test]
    fn test_deletion_policy_tracks_protection() {
        let (graph, _, ds) = declare_for(&DeploymentConfig::staging()).unwrap();
        let node = graph.get(ds.cluster.id()).unwrap();
        assert_eq!(node.deletion_policy, Some(DeletionPolicy::Delete));

        let (graph, _, ds) = declare_for(&DeploymentConfig::production()).unwrap();
        let node = graph.get(ds.cluster.id()).unwrap();
        assert_eq!(node.deletion_policy, Some(DeletionPolicy::Snapshot));
        assert_eq!(node.properties["DeletionProtection"], true);
        assert_eq!(node.properties["EnableIAMDatabaseAuthentication"], true);
    }

    #[test]
    fn test_password_resolved_from_secret() {
        let (graph, _, ds) = declare_for(&DeploymentConfig::staging()).unwrap();
        let node = graph.get(ds.cluster.id()).unwrap();
        assert!(node.references.contains(ds.secret.id()));
        assert!(graph
            .of_type("AWS::SecretsManager::SecretTargetAttachment")
            .next()
            .is_some());
    }

    #[test]
    fn test_production_requires_durability() {
        let mut config = DeploymentConfig::production();
        config.datastore.deletion_protection = false;
        assert!(matches!(validate(&config), Err(InfraError::DurabilityRequired(_))));

        let mut config = DeploymentConfig::production();
        config.datastore.backup_retention_days = 3;
        assert!(matches!(validate(&config), Err(InfraError::DurabilityRequired(_))));

        // staging may run without either
        assert!(validate(&DeploymentConfig::staging()).is_ok());
    }

    #[test]
    fn test_capacity_bounds() {
        let mut config = DeploymentConfig::staging();
        config.datastore.min_capacity = 0.25;
        assert!(validate(&config).is_err());

        let mut config = DeploymentConfig::staging();
        config.datastore.max_capacity = 2.3;
        assert!(validate(&config).is_err());

        let mut config = DeploymentConfig::staging();
        config.datastore.min_capacity = 4.0;
        config.datastore.max_capacity = 2.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_connect_arn_names_iam_user() {
        let (_, _, ds) = declare_for(&DeploymentConfig::staging()).unwrap();
        assert_eq!(
            ds.db_user_arn.pattern().unwrap(),
            "arn:aws:rds-db:us-east-1:069597727371:dbuser:${DatastoreCluster.DBClusterResourceId}/goapi_app"
        );
    }
}
