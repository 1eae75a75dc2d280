//! Init command

use super::Context;
use crate::output::print_success;
use anyhow::Result;
use goapi_infra::DeploymentConfig;
use std::path::PathBuf;

pub fn handle(ctx: &Context, out: Option<PathBuf>) -> Result<()> {
    let config = DeploymentConfig::preset(ctx.environment);
    match out {
        Some(path) => {
            config.save(&path)?;
            print_success(&format!(
                "Wrote {} preset to {}",
                ctx.environment.as_str(),
                path.display()
            ));
        }
        None => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}
