//! Deploy command

use super::Context;
use crate::output::{print_info, print_success};
use anyhow::Result;
use goapi_infra::ProvisioningEngine;
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

#[derive(Debug, Serialize, Tabled)]
struct StackOutputRow {
    output: String,
    value: String,
}

pub async fn handle(ctx: &Context, out: Option<PathBuf>) -> Result<()> {
    let (stack, paths) = super::synth::handle(ctx, out)?;
    let engine = ctx.engine();
    print_info(&format!("Handing {} to {}", stack.stack_name, engine.name()));

    let report = engine.deploy(&stack, &paths.template).await?;
    print_success(&format!("Deployed {}", report.stack_name));

    if ctx.format.is_table() {
        let rows: Vec<StackOutputRow> = report
            .outputs
            .iter()
            .map(|(output, value)| StackOutputRow {
                output: output.clone(),
                value: value.clone(),
            })
            .collect();
        ctx.format.print_rows(&rows)?;
    } else {
        ctx.format.print(&report)?;
    }
    Ok(())
}
