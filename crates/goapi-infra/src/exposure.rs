//! Exposure Layer
//!
//! Internet-facing load balancer, IP target group and listeners. TLS is
//! driven entirely by the presence of a certificate reference.

use crate::config::{DeploymentConfig, HealthCheckConfig};
use crate::error::{InfraError, InfraResult};
use crate::graph::{Declaration, ResourceGraph, ResourceRef, Token};
use crate::network::Network;
use crate::resources::Tag;
use crate::security::{SecurityBoundaries, HTTPS_PORT, HTTP_PORT};
use serde::Serialize;

const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadBalancer {
    pub name: String,
    pub scheme: String,
    #[serde(rename = "Type")]
    pub lb_type: String,
    pub subnets: Vec<Token>,
    pub security_groups: Vec<Token>,
    pub load_balancer_attributes: Vec<Attribute>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    fn new(key: &str, value: impl ToString) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TargetGroup {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    pub target_type: String,
    pub vpc_id: Token,
    pub health_check_enabled: bool,
    pub health_check_path: String,
    pub health_check_interval_seconds: u32,
    pub health_check_timeout_seconds: u32,
    pub healthy_threshold_count: u32,
    pub unhealthy_threshold_count: u32,
    pub matcher: Matcher,
    pub target_group_attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Matcher {
    pub http_code: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Listener {
    pub load_balancer_arn: Token,
    pub port: u16,
    pub protocol: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<Certificate>,
    pub default_actions: Vec<ListenerAction>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Certificate {
    pub certificate_arn: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListenerAction {
    #[serde(rename = "Type")]
    pub action_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_group_arn: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_config: Option<RedirectConfig>,
}

impl ListenerAction {
    fn forward(target_group: &ResourceRef) -> Self {
        Self {
            action_type: "forward".into(),
            target_group_arn: Some(target_group.token()),
            redirect_config: None,
        }
    }

    fn redirect_to_https() -> Self {
        Self {
            action_type: "redirect".into(),
            target_group_arn: None,
            redirect_config: Some(RedirectConfig {
                protocol: "HTTPS".into(),
                port: HTTPS_PORT.to_string(),
                status_code: "HTTP_301".into(),
            }),
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect_config.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RedirectConfig {
    pub protocol: String,
    pub port: String,
    pub status_code: String,
}

/// Check the target group health check against provider limits and the
/// service's liveness endpoint.
pub fn validate_health_check(check: &HealthCheckConfig, liveness_path: &str) -> InfraResult<()> {
    if check.path != liveness_path {
        return Err(InfraError::HealthCheckMismatch {
            configured: check.path.clone(),
            liveness: liveness_path.to_string(),
        });
    }
    if !(5..=300).contains(&check.interval_secs) {
        return Err(InfraError::InvalidConfig(format!(
            "health check interval {}s outside 5-300s",
            check.interval_secs
        )));
    }
    if !(2..=120).contains(&check.timeout_secs) || check.timeout_secs >= check.interval_secs {
        return Err(InfraError::InvalidConfig(format!(
            "health check timeout {}s must be 2-120s and below the {}s interval",
            check.timeout_secs, check.interval_secs
        )));
    }
    for (name, value) in [
        ("healthy", check.healthy_threshold),
        ("unhealthy", check.unhealthy_threshold),
    ] {
        if !(2..=10).contains(&value) {
            return Err(InfraError::InvalidConfig(format!(
                "{} threshold {} outside 2-10",
                name, value
            )));
        }
    }
    Ok(())
}

pub fn validate(config: &DeploymentConfig) -> InfraResult<()> {
    validate_health_check(&config.exposure.health_check, &config.service.liveness_path)?;
    if config.exposure.deregistration_delay_secs > 3600 {
        return Err(InfraError::InvalidConfig(format!(
            "deregistration delay {}s exceeds 3600s",
            config.exposure.deregistration_delay_secs
        )));
    }
    if let Some(arn) = &config.exposure.certificate_arn {
        if !arn.starts_with("arn:") || !arn.contains(":certificate/") {
            return Err(InfraError::InvalidConfig(format!(
                "`{}` is not a certificate ARN",
                arn
            )));
        }
    }
    if format!("{}-alb", config.service.name).len() > MAX_NAME_LEN {
        return Err(InfraError::InvalidConfig(format!(
            "service name `{}` too long for load balancer naming",
            config.service.name
        )));
    }
    Ok(())
}

/// Declared exposure layer
#[derive(Debug, Clone)]
pub struct Exposure {
    pub load_balancer: ResourceRef,
    pub target_group: ResourceRef,
    pub listeners: Vec<ResourceRef>,
    pub tls: bool,
    /// HTTP requests are redirected to HTTPS
    pub redirect: bool,
}

impl Exposure {
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }
}

pub fn declare(
    graph: &mut ResourceGraph,
    config: &DeploymentConfig,
    network: &Network,
    boundaries: &SecurityBoundaries,
) -> InfraResult<Exposure> {
    validate(config)?;
    let check = &config.exposure.health_check;
    let certificate = config.exposure.certificate_arn.as_ref();

    tracing::info!(
        tls = certificate.is_some(),
        health_path = %check.path,
        "declaring exposure layer"
    );

    let load_balancer = graph.declare(Declaration::new(
        "LoadBalancer",
        LoadBalancer {
            name: format!("{}-alb", config.service.name),
            scheme: "internet-facing".into(),
            lb_type: "application".into(),
            subnets: Network::subnet_tokens(&network.public_subnets),
            security_groups: vec![boundaries.load_balancer.attr("GroupId")],
            load_balancer_attributes: vec![Attribute::new(
                "routing.http.drop_invalid_header_fields.enabled",
                true,
            )],
            tags: vec![Tag::name(format!("{}/LoadBalancer", config.stack_name))],
        },
    ))?;

    let target_group = graph.declare(Declaration::new(
        "TargetGroup",
        TargetGroup {
            name: format!("{}-tg", config.service.name),
            port: config.service.container_port,
            protocol: "HTTP".into(),
            target_type: "ip".into(),
            vpc_id: network.vpc.token(),
            health_check_enabled: true,
            health_check_path: check.path.clone(),
            health_check_interval_seconds: check.interval_secs,
            health_check_timeout_seconds: check.timeout_secs,
            healthy_threshold_count: check.healthy_threshold,
            unhealthy_threshold_count: check.unhealthy_threshold,
            matcher: Matcher {
                http_code: "200".into(),
            },
            target_group_attributes: vec![Attribute::new(
                "deregistration_delay.timeout_seconds",
                config.exposure.deregistration_delay_secs,
            )],
        },
    ))?;

    let listeners = match certificate {
        Some(arn) => vec![
            graph.declare(Declaration::new(
                "HttpsListener",
                Listener {
                    load_balancer_arn: load_balancer.token(),
                    port: HTTPS_PORT,
                    protocol: "HTTPS".into(),
                    certificates: vec![Certificate {
                        certificate_arn: arn.clone(),
                    }],
                    default_actions: vec![ListenerAction::forward(&target_group)],
                },
            ))?,
            graph.declare(Declaration::new(
                "HttpListener",
                Listener {
                    load_balancer_arn: load_balancer.token(),
                    port: HTTP_PORT,
                    protocol: "HTTP".into(),
                    certificates: vec![],
                    default_actions: vec![ListenerAction::redirect_to_https()],
                },
            ))?,
        ],
        None => vec![graph.declare(Declaration::new(
            "HttpListener",
            Listener {
                load_balancer_arn: load_balancer.token(),
                port: HTTP_PORT,
                protocol: "HTTP".into(),
                certificates: vec![],
                default_actions: vec![ListenerAction::forward(&target_group)],
            },
        ))?],
    };

    Ok(Exposure {
        load_balancer,
        target_group,
        listeners,
        tls: certificate.is_some(),
        redirect: certificate.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceKind;
    use crate::{network, security};

    const CERT: &str = "arn:aws:acm:us-east-1:069597727371:certificate/0f1e2d3c";

    fn declare_for(config: &DeploymentConfig) -> (ResourceGraph, Exposure) {
        let mut graph = ResourceGraph::new();
        let net = network::declare(&mut graph, config).unwrap();
        let sg = security::declare_boundaries(&mut graph, config, &net).unwrap();
        let exposure = declare(&mut graph, config, &net, &sg).unwrap();
        (graph, exposure)
    }

    fn listener<'a>(graph: &'a ResourceGraph, r: &ResourceRef) -> &'a Listener {
        match &graph.get(r.id()).unwrap().kind {
            ResourceKind::Listener(l) => l,
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_tls_round_trip() {
        let mut config = DeploymentConfig::staging();
        config.exposure.certificate_arn = Some(CERT.into());
        let (graph, exposure) = declare_for(&config);
        assert!(exposure.redirect);
        assert_eq!(exposure.listeners.len(), 2);
        let http = exposure
            .listeners
            .iter()
            .map(|l| listener(&graph, l))
            .find(|l| l.port == HTTP_PORT)
            .unwrap();
        assert!(http.default_actions[0].is_redirect());

        config.exposure.certificate_arn = None;
        let (graph, exposure) = declare_for(&config);
        assert!(!exposure.redirect);
        assert_eq!(exposure.scheme(), "http");
        assert_eq!(exposure.listeners.len(), 1);
        let only = listener(&graph, &exposure.listeners[0]);
        assert_eq!(only.port, HTTP_PORT);
        assert!(!only.default_actions[0].is_redirect());
        assert_eq!(graph.of_type("AWS::ElasticLoadBalancingV2::Listener").count(), 1);
    }

    #[test]
    fn test_health_check_mismatch_flagged() {
        let mut config = DeploymentConfig::staging();
        config.exposure.health_check.path = "/".into();

        let mut graph = ResourceGraph::new();
        let net = network::declare(&mut graph, &config).unwrap();
        let sg = security::declare_boundaries(&mut graph, &config, &net).unwrap();
        let err = declare(&mut graph, &config, &net, &sg).unwrap_err();
        assert!(matches!(
            err,
            InfraError::HealthCheckMismatch { ref configured, ref liveness }
                if configured == "/" && liveness == "/api/healthcheck"
        ));
        assert_eq!(graph.of_type("AWS::ElasticLoadBalancingV2::TargetGroup").count(), 0);
    }

    #[test]
    fn test_health_check_bounds() {
        let base = DeploymentConfig::staging().exposure.health_check;
        let liveness = base.path.clone();
        assert!(validate_health_check(&base, &liveness).is_ok());

        let mut check = base.clone();
        check.timeout_secs = check.interval_secs;
        assert!(validate_health_check(&check, &liveness).is_err());

        let mut check = base.clone();
        check.interval_secs = 4;
        assert!(validate_health_check(&check, &liveness).is_err());

        let mut check = base;
        check.unhealthy_threshold = 11;
        assert!(validate_health_check(&check, &liveness).is_err());
    }

    #[test]
    fn test_target_group_matches_liveness() {
        let (graph, exposure) = declare_for(&DeploymentConfig::production());
        let props = &graph.get(exposure.target_group.id()).unwrap().properties;
        assert_eq!(props["HealthCheckPath"], "/api/healthcheck");
        assert_eq!(props["TargetType"], "ip");
        assert_eq!(props["Matcher"]["HttpCode"], "200");
    }
}
