//! CLI Settings

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// `~/.goapi-infra/config.toml`
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub aws_profile: Option<String>,
    pub region: Option<String>,
    pub account_id: Option<String>,
    pub output_dir: Option<PathBuf>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("cannot find home directory")?;
        Ok(home.join(".goapi-infra").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "aws_profile = \"ops\"\noutput_dir = \"build/cdk.out\"\n").unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.aws_profile.as_deref(), Some("ops"));
        assert_eq!(settings.region, None);
        assert_eq!(settings.output_dir, Some(PathBuf::from("build/cdk.out")));
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "aws_profile = [").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }
}
