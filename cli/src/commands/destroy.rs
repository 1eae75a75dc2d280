//! Destroy command

use super::Context;
use crate::output::{print_success, print_warning};
use anyhow::{bail, Result};
use goapi_infra::{datastore, ProvisioningEngine};

pub async fn handle(ctx: &Context, yes: bool) -> Result<()> {
    let config = ctx.deployment_config()?;
    if !yes {
        bail!(
            "refusing to delete {} without --yes",
            config.stack_name
        );
    }

    if config.datastore.deletion_protection {
        print_warning(&format!(
            "datastore deletion protection is on; the engine will reject deletion (policy {:?})",
            datastore::deletion_policy(&config.datastore)
        ));
    }

    ctx.engine().destroy(&config.stack_name).await?;
    print_success(&format!("Deleted {}", config.stack_name));
    Ok(())
}
