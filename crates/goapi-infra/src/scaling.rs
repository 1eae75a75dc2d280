//! Scaling Controller
//!
//! Target-tracking replica control on average CPU, declared for the engine
//! and modeled locally so its bounds and cooldown behavior can be checked.

use crate::config::{DeploymentConfig, ScalingConfig};
use crate::error::{InfraError, InfraResult};
use crate::graph::{Declaration, ResourceGraph, ResourceRef, Token};
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalableTarget {
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub resource_id: Token,
    pub scalable_dimension: String,
    pub service_namespace: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalingPolicy {
    pub policy_name: String,
    pub policy_type: String,
    pub scaling_target_id: Token,
    pub target_tracking_scaling_policy_configuration: TargetTrackingConfiguration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TargetTrackingConfiguration {
    pub target_value: f64,
    pub predefined_metric_specification: PredefinedMetric,
    pub scale_in_cooldown: u64,
    pub scale_out_cooldown: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PredefinedMetric {
    pub predefined_metric_type: String,
}

pub fn validate(scaling: &ScalingConfig, desired: u32) -> InfraResult<()> {
    if scaling.min_replicas < 1 {
        return Err(InfraError::InvalidScaling(
            "minimum replicas must be at least 1".into(),
        ));
    }
    if !(scaling.min_replicas <= desired && desired <= scaling.max_replicas) {
        return Err(InfraError::InvalidScaling(format!(
            "need {} <= desired ({}) <= {}",
            scaling.min_replicas, desired, scaling.max_replicas
        )));
    }
    if !(scaling.target_cpu_percent > 0.0 && scaling.target_cpu_percent <= 100.0) {
        return Err(InfraError::InvalidScaling(format!(
            "target utilization {}% outside (0, 100]",
            scaling.target_cpu_percent
        )));
    }
    if scaling.sustain_samples == 0 {
        return Err(InfraError::InvalidScaling(
            "sustain window must hold at least one sample".into(),
        ));
    }
    Ok(())
}

/// Declared scaling controller
#[derive(Debug, Clone)]
pub struct Scaling {
    pub target: ResourceRef,
    pub policy: ResourceRef,
}

pub fn declare(
    graph: &mut ResourceGraph,
    config: &DeploymentConfig,
    scaling: &ScalingConfig,
    cluster: &ResourceRef,
    service: &ResourceRef,
) -> InfraResult<Scaling> {
    validate(scaling, config.service.desired_count)?;

    tracing::info!(
        min = scaling.min_replicas,
        max = scaling.max_replicas,
        target_cpu = scaling.target_cpu_percent,
        "declaring scaling controller"
    );

    let target = graph.declare(Declaration::new(
        "ServiceScalableTarget",
        ScalableTarget {
            min_capacity: scaling.min_replicas,
            max_capacity: scaling.max_replicas,
            resource_id: Token::join([
                Token::literal("service/"),
                cluster.token(),
                Token::literal("/"),
                service.attr("Name"),
            ]),
            scalable_dimension: "ecs:service:DesiredCount".into(),
            service_namespace: "ecs".into(),
        },
    ))?;

    let policy = graph.declare(Declaration::new(
        "ServiceCpuScalingPolicy",
        ScalingPolicy {
            policy_name: format!("{}-cpu-target", config.service.name),
            policy_type: "TargetTrackingScaling".into(),
            scaling_target_id: target.token(),
            target_tracking_scaling_policy_configuration: TargetTrackingConfiguration {
                target_value: scaling.target_cpu_percent,
                predefined_metric_specification: PredefinedMetric {
                    predefined_metric_type: "ECSServiceAverageCPUUtilization".into(),
                },
                scale_in_cooldown: scaling.scale_in_cooldown_secs,
                scale_out_cooldown: scaling.scale_out_cooldown_secs,
            },
        },
    ))?;

    Ok(Scaling { target, policy })
}

// =============================================================================
// Controller model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Out,
    In,
}

/// One replica-count change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingAdjustment {
    pub at: u64,
    pub from: u32,
    pub to: u32,
    pub direction: Direction,
    pub mean_cpu: f64,
}

/// Local model of target tracking
#[derive(Debug, Clone)]
pub struct ScalingController {
    config: ScalingConfig,
    replicas: u32,
    window: VecDeque<f64>,
    last_adjustment: Option<u64>,
}

impl ScalingController {
    pub fn new(config: ScalingConfig, initial_replicas: u32) -> Self {
        let replicas = initial_replicas
            .max(config.min_replicas)
            .min(config.max_replicas);
        Self {
            window: VecDeque::with_capacity(config.sustain_samples),
            config,
            replicas,
            last_adjustment: None,
        }
    }

    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    fn cooldown(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Out => self.config.scale_out_cooldown_secs,
            Direction::In => self.config.scale_in_cooldown_secs,
        }
    }

    /// Feed one CPU sample taken at `now` (seconds). Returns the adjustment
    /// issued, if any.
    pub fn observe(&mut self, now: u64, cpu_percent: f64) -> Option<ScalingAdjustment> {
        if !cpu_percent.is_finite() {
            tracing::warn!(cpu_percent, "ignoring non-finite utilization sample");
            return None;
        }

        let sustain = self.config.sustain_samples.max(1);
        self.window.push_back(cpu_percent.max(0.0));
        while self.window.len() > sustain {
            self.window.pop_front();
        }
        if self.window.len() < sustain {
            return None;
        }

        let target = self.config.target_cpu_percent;
        let direction = if self.window.iter().all(|&s| s > target) {
            Direction::Out
        } else if self.window.iter().all(|&s| s < target) {
            Direction::In
        } else {
            return None;
        };

        if let Some(last) = self.last_adjustment {
            if now.saturating_sub(last) < self.cooldown(direction) {
                return None;
            }
        }

        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        let wanted = (f64::from(self.replicas) * mean / target).ceil();
        let desired = wanted
            .max(f64::from(self.config.min_replicas))
            .min(f64::from(self.config.max_replicas)) as u32;

        let moves = match direction {
            Direction::Out => desired > self.replicas,
            Direction::In => desired < self.replicas,
        };
        if !moves {
            return None;
        }

        let adjustment = ScalingAdjustment {
            at: now,
            from: self.replicas,
            to: desired,
            direction,
            mean_cpu: mean,
        };
        tracing::debug!(
            from = adjustment.from,
            to = adjustment.to,
            direction = ?direction,
            mean_cpu = mean,
            "scaling adjustment"
        );

        self.replicas = desired;
        self.last_adjustment = Some(now);
        self.window.clear();
        Some(adjustment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> ScalingConfig {
        ScalingConfig {
            target_cpu_percent: 50.0,
            min_replicas: 2,
            max_replicas: 5,
            scale_in_cooldown_secs: 60,
            scale_out_cooldown_secs: 60,
            sustain_samples: 3,
        }
    }

    #[test]
    fn test_validate_bounds() {
        assert!(validate(&config(), 2).is_ok());
        assert!(matches!(validate(&config(), 1), Err(InfraError::InvalidScaling(_))));
        assert!(validate(&config(), 6).is_err());

        let mut bad = config();
        bad.target_cpu_percent = 0.0;
        assert!(validate(&bad, 2).is_err());

        let mut bad = config();
        bad.min_replicas = 0;
        assert!(validate(&bad, 2).is_err());
    }

    #[test]
    fn test_requires_sustained_load() {
        let mut ctl = ScalingController::new(config(), 2);
        assert!(ctl.observe(0, 90.0).is_none());
        assert!(ctl.observe(10, 90.0).is_none());
        // a dip breaks the window
        assert!(ctl.observe(20, 40.0).is_none());
        assert!(ctl.observe(30, 90.0).is_none());
        assert!(ctl.observe(40, 90.0).is_none());

        let adj = ctl.observe(50, 90.0).unwrap();
        assert_eq!(adj.direction, Direction::Out);
        assert_eq!((adj.from, adj.to), (2, 4));
        assert_eq!(ctl.replicas(), 4);
    }

    #[test]
    fn test_cooldown_blocks_next_adjustment() {
        let mut ctl = ScalingController::new(config(), 2);
        for t in [0, 10, 20] {
            ctl.observe(t, 100.0);
        }
        assert_eq!(ctl.replicas(), 4);

        for t in [30, 40, 50] {
            assert!(ctl.observe(t, 100.0).is_none());
        }
        let adj = ctl.observe(80, 100.0).unwrap();
        assert_eq!(adj.to, 5);
    }

    #[test]
    fn test_scale_in_clamps_to_min() {
        let mut ctl = ScalingController::new(config(), 5);
        for t in [0, 10] {
            assert!(ctl.observe(t, 1.0).is_none());
        }
        let adj = ctl.observe(20, 1.0).unwrap();
        assert_eq!(adj.direction, Direction::In);
        assert_eq!(adj.to, 2);
    }

    #[test]
    fn test_declares_target_tracking() {
        let deployment = crate::stack::build(&DeploymentConfig::production()).unwrap();
        let scaling = deployment.scaling.as_ref().unwrap();
        let target = deployment.graph.get(scaling.target.id()).unwrap();
        assert_eq!(target.properties["MinCapacity"], 2);
        assert_eq!(target.properties["MaxCapacity"], 5);
        assert_eq!(
            target.properties["ResourceId"]["Fn::Join"][1][0],
            "service/"
        );
        let policy = deployment.graph.get(scaling.policy.id()).unwrap();
        assert_eq!(
            policy.properties["TargetTrackingScalingPolicyConfiguration"]
                ["PredefinedMetricSpecification"]["PredefinedMetricType"],
            "ECSServiceAverageCPUUtilization"
        );
    }

    proptest! {
        #[test]
        fn prop_replicas_bounded_and_cooldown_respected(
            samples in prop::collection::vec((1u64..120, 0.0f64..=100.0), 1..200),
            initial in 0u32..10,
        ) {
            let cfg = config();
            let mut ctl = ScalingController::new(cfg.clone(), initial);
            let mut now = 0u64;
            let mut last: Option<u64> = None;
            let min_cooldown = cfg.scale_in_cooldown_secs.min(cfg.scale_out_cooldown_secs);

            for (dt, cpu) in samples {
                now += dt;
                if let Some(adj) = ctl.observe(now, cpu) {
                    if let Some(prev) = last {
                        prop_assert!(adj.at - prev >= min_cooldown);
                    }
                    last = Some(adj.at);
                }
                prop_assert!(ctl.replicas() >= cfg.min_replicas);
                prop_assert!(ctl.replicas() <= cfg.max_replicas);
            }
        }
    }
}
