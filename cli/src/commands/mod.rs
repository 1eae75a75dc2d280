//! CLI Commands

pub mod deploy;
pub mod destroy;
pub mod init;
pub mod plan;
pub mod synth;
pub mod validate;

use crate::config::Settings;
use crate::output::OutputFormat;
use anyhow::{Context as _, Result};
use goapi_infra::{CloudFormationEngine, DeploymentConfig, Environment};
use std::path::PathBuf;

const DEFAULT_OUT_DIR: &str = "cdk.out";

/// Resolved global options
pub struct Context {
    pub environment: Environment,
    pub config_path: Option<PathBuf>,
    pub format: OutputFormat,
    pub profile: Option<String>,
    pub region: Option<String>,
    pub settings: Settings,
}

impl Context {
    /// Configuration file if given, otherwise the environment preset, with
    /// region and account overrides applied.
    pub fn deployment_config(&self) -> Result<DeploymentConfig> {
        let mut config = match &self.config_path {
            Some(path) => DeploymentConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DeploymentConfig::preset(self.environment),
        };
        if let Some(region) = &self.region {
            config.region = region.clone();
        }
        if let Some(account) = &self.settings.account_id {
            config.account_id = account.clone();
        }
        Ok(config)
    }

    pub fn out_dir(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.settings.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR))
    }

    pub fn engine(&self) -> CloudFormationEngine {
        CloudFormationEngine::new()
            .with_profile(self.profile.clone())
            .with_region(self.region.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn context(environment: Environment) -> Context {
        Context {
            environment,
            config_path: None,
            format: OutputFormat::Json,
            profile: None,
            region: None,
            settings: Settings::default(),
        }
    }

    #[test]
    fn test_preset_follows_environment() {
        let config = context(Environment::Production).deployment_config().unwrap();
        assert_eq!(config.stack_name, "GoApiProdInfraStack");
    }

    #[test]
    fn test_overrides_apply() {
        let mut ctx = context(Environment::Staging);
        ctx.region = Some("eu-west-1".into());
        ctx.settings.account_id = Some("111122223333".into());
        let config = ctx.deployment_config().unwrap();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.account_id, "111122223333");
    }

    #[test]
    fn test_config_file_wins_over_preset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        let mut file_config = DeploymentConfig::staging();
        file_config.stack_name = "GoApiSandbox".into();
        file_config.save(&path).unwrap();

        let mut ctx = context(Environment::Production);
        ctx.config_path = Some(path);
        assert_eq!(ctx.deployment_config().unwrap().stack_name, "GoApiSandbox");
    }

    #[test]
    fn test_out_dir_precedence() {
        let mut ctx = context(Environment::Staging);
        assert_eq!(ctx.out_dir(None), PathBuf::from("cdk.out"));
        ctx.settings.output_dir = Some("build".into());
        assert_eq!(ctx.out_dir(None), PathBuf::from("build"));
        assert_eq!(ctx.out_dir(Some("x".into())), PathBuf::from("x"));
    }
}
