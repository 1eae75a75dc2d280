//! Validate command

use super::Context;
use crate::output::{print_success, print_warning};
use anyhow::Result;
use goapi_infra::{simulate_backend, stack, InfraError};

/// Probes simulated when explaining a health-check mismatch
const SIMULATED_INTERVALS: u32 = 20;

pub fn handle(ctx: &Context) -> Result<()> {
    let config = ctx.deployment_config()?;

    if let Err(e) = stack::validate(&config) {
        if let InfraError::HealthCheckMismatch { .. } = e {
            let check = &config.exposure.health_check;
            let sim = simulate_backend(check, &config.service.liveness_path, SIMULATED_INTERVALS);
            print_warning(&format!(
                "probing {} would never mark a task healthy and replace {} tasks in {} probes",
                check.path, sim.replacements, SIMULATED_INTERVALS
            ));
        }
        return Err(e.into());
    }

    if config.service.assign_public_ip {
        print_warning("service tasks are assigned public IP addresses");
    }

    print_success(&format!(
        "{} ({}) is valid",
        config.stack_name,
        config.environment.as_str()
    ));
    Ok(())
}
