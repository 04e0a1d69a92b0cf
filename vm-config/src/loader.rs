//! Locating and reading configuration files.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use vm_core::error::{Result, VmError};

use crate::config::OrchestratorConfig;
use crate::machine::MachineSpec;

/// `~/.vm/orchestrator.yaml`, or `None` when no home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".vm").join("orchestrator.yaml"))
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        VmError::Config(format!(
            "Failed to read configuration file {}: {}",
            path.display(),
            e
        ))
    })
}

impl OrchestratorConfig {
    /// Parses YAML, applies environment overrides and validates.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: OrchestratorConfig = serde_yaml_ng::from_str(yaml)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading orchestrator configuration");
        Self::from_yaml(&read_file(path)?)
    }

    /// Loads the default file if it exists, otherwise built-in defaults.
    /// Environment overrides apply either way.
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No orchestrator configuration file found, using defaults");
                let mut config = OrchestratorConfig::default();
                config.apply_env_overrides()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml_ng::to_string(self)?)?;
        Ok(())
    }
}

impl MachineSpec {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&read_file(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_path_under_home() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with(".vm/orchestrator.yaml"));
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("orchestrator.yaml");

        let mut config = OrchestratorConfig::default();
        config.poll_interval_ms = 50;
        config.timeouts.stop_ms = 2_000;
        config.save(&path).unwrap();

        let loaded: OrchestratorConfig =
            serde_yaml_ng::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.poll_interval_ms, 50);
        assert_eq!(loaded.timeouts.stop_ms, 2_000);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = OrchestratorConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, VmError::Config(_)));
    }

    #[test]
    fn test_load_machine_spec() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.yaml");
        fs::write(&path, "name: vmA\nmemory_mb: 512\n").unwrap();

        let spec = MachineSpec::load(&path).unwrap();
        assert_eq!(spec.name, "vmA");
        assert_eq!(spec.memory_mb, 512);
    }

    #[test]
    fn test_invalid_yaml_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.yaml");
        fs::write(&path, "name: [unterminated").unwrap();
        assert!(matches!(
            MachineSpec::load(&path),
            Err(VmError::Serialization(_))
        ));
    }
}
