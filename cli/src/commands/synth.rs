//! Synth command

use super::Context;
use crate::output::print_success;
use anyhow::{Context as _, Result};
use goapi_infra::template::SynthesizedPaths;
use goapi_infra::{stack, SynthesizedStack};
use std::path::PathBuf;

pub fn handle(ctx: &Context, out: Option<PathBuf>) -> Result<(SynthesizedStack, SynthesizedPaths)> {
    let config = ctx.deployment_config()?;
    let deployment = stack::build(&config)?;
    let synthesized = SynthesizedStack::from_deployment(&deployment);

    let dir = ctx.out_dir(out);
    let paths = synthesized
        .write_to_dir(&dir)
        .with_context(|| format!("writing to {}", dir.display()))?;

    print_success(&format!(
        "Synthesized {} ({} resources) to {}",
        synthesized.stack_name,
        synthesized.template.resources.len(),
        paths.template.display()
    ));
    Ok((synthesized, paths))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::context;
    use goapi_infra::Environment;

    #[test]
    fn test_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Environment::Production);
        let (stack, paths) = handle(&ctx, Some(dir.path().to_path_buf())).unwrap();

        assert_eq!(stack.stack_name, "GoApiProdInfraStack");
        assert!(paths.template.exists());
        assert!(paths.manifest.exists());
    }
}
