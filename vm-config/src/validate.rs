//! Validation for configuration documents.

use std::collections::HashSet;

use tracing::warn;
use vm_core::error::{Result, VmError};
use vm_core::DeviceType;

use crate::config::OrchestratorConfig;
use crate::machine::{MachineSpec, MediumSource};

const MIN_MEMORY_MB: u64 = 4;
const MAX_MEMORY_MB: u64 = 2_097_152;
const MAX_VRAM_MB: u32 = 256;
const BOOT_SLOTS: usize = 4;

fn config_error(message: impl Into<String>) -> VmError {
    VmError::Config(message.into())
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        let scheme = self
            .endpoint
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| config_error(format!("Invalid endpoint: {}", self.endpoint)))?;
        if !matches!(scheme, "sim" | "http" | "https") {
            return Err(config_error(format!(
                "Unsupported endpoint scheme '{}' (expected sim, http or https)",
                scheme
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(config_error("poll_interval_ms must be greater than zero"));
        }
        if self.lock_retry.max_attempts == 0 {
            return Err(config_error("lock_retry.max_attempts must be at least 1"));
        }
        for (field, value) in [
            ("timeouts.create_storage_ms", self.timeouts.create_storage_ms),
            ("timeouts.start_ms", self.timeouts.start_ms),
            ("timeouts.stop_ms", self.timeouts.stop_ms),
        ] {
            if value == 0 {
                return Err(config_error(format!("{} must be greater than zero", field)));
            }
        }
        if let Some(entry) = self.launch_env.iter().find(|e| !e.contains('=')) {
            return Err(config_error(format!(
                "launch_env entry '{}' is not of the form KEY=value",
                entry
            )));
        }
        if self.password.is_some() && self.user.is_none() {
            warn!("A backend password is configured without a user; it will be ignored");
        }
        Ok(())
    }
}

impl MachineSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(config_error("Machine name must not be empty"));
        }
        if self.name.contains(['/', '\\']) {
            return Err(config_error(format!(
                "Machine name '{}' must not contain path separators",
                self.name
            )));
        }
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(config_error(format!(
                "memory_mb {} is outside [{}, {}]",
                self.memory_mb, MIN_MEMORY_MB, MAX_MEMORY_MB
            )));
        }
        if self.vram_mb > MAX_VRAM_MB {
            return Err(config_error(format!(
                "vram_mb {} exceeds {}",
                self.vram_mb, MAX_VRAM_MB
            )));
        }

        let mut controller_names = HashSet::new();
        for controller in &self.controllers {
            if !controller_names.insert(controller.name.as_str()) {
                return Err(config_error(format!(
                    "Storage controller '{}' is declared twice",
                    controller.name
                )));
            }
        }

        let mut slots = HashSet::new();
        let mut locations = HashSet::new();
        for attachment in &self.attachments {
            let controller = self.controller(&attachment.controller).ok_or_else(|| {
                config_error(format!(
                    "Attachment refers to unknown controller '{}'",
                    attachment.controller
                ))
            })?;
            let bus = controller.bus;
            if attachment.port >= bus.port_count() || attachment.device >= bus.devices_per_port()
            {
                return Err(config_error(format!(
                    "Port {} / device {} is out of range for controller '{}'",
                    attachment.port, attachment.device, controller.name
                )));
            }
            if !bus.accepts(attachment.device_type) {
                return Err(config_error(format!(
                    "Controller '{}' cannot hold a {} device",
                    controller.name, attachment.device_type
                )));
            }
            if !slots.insert((
                attachment.controller.as_str(),
                attachment.port,
                attachment.device,
            )) {
                return Err(config_error(format!(
                    "Slot {}:{}:{} is used twice",
                    attachment.controller, attachment.port, attachment.device
                )));
            }

            match &attachment.medium {
                Some(MediumSource::Create {
                    location,
                    size_bytes,
                    ..
                }) => {
                    if attachment.device_type != DeviceType::HardDisk {
                        return Err(config_error(format!(
                            "Only hard disks can be created, '{}' is a {}",
                            location, attachment.device_type
                        )));
                    }
                    if *size_bytes == 0 {
                        return Err(config_error(format!(
                            "Disk '{}' must have a non-zero size",
                            location
                        )));
                    }
                }
                Some(MediumSource::Open { .. }) | None => {}
            }
            if let Some(medium) = &attachment.medium {
                if !locations.insert(medium.location()) {
                    return Err(config_error(format!(
                        "Medium '{}' is attached more than once",
                        medium.location()
                    )));
                }
            }
        }

        if self.boot_order.len() > BOOT_SLOTS {
            return Err(config_error(format!(
                "boot_order lists {} devices, at most {} are supported",
                self.boot_order.len(),
                BOOT_SLOTS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_core::StorageBus;

    fn sample() -> MachineSpec {
        MachineSpec::new("vmA", "Linux26_64", 1024)
            .with_controller("SATA", StorageBus::Sata)
            .with_new_disk("SATA", 0, "/vms/vmA.vdi", 1 << 30)
    }

    #[test]
    fn test_valid_spec() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_controller() {
        let spec = sample().with_dvd("IDE", 0, 0, "/isos/a.iso");
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("unknown controller 'IDE'"));
    }

    #[test]
    fn test_rejects_duplicate_slot() {
        let spec = sample().with_new_disk("SATA", 0, "/vms/other.vdi", 1 << 30);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_rejects_memory_out_of_range() {
        let mut spec = sample();
        spec.memory_mb = 0;
        assert!(matches!(spec.validate(), Err(VmError::Config(_))));
    }

    #[test]
    fn test_rejects_dvd_on_floppy_controller() {
        let spec = MachineSpec::new("vmA", "Other", 64)
            .with_controller("FD", StorageBus::Floppy)
            .with_dvd("FD", 0, 0, "/isos/a.iso");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(OrchestratorConfig::default().validate().is_ok());

        let bad_scheme = OrchestratorConfig {
            endpoint: "ftp://host".into(),
            ..Default::default()
        };
        assert!(bad_scheme.validate().is_err());

        let mut no_retries = OrchestratorConfig::default();
        no_retries.lock_retry.max_attempts = 0;
        assert!(no_retries.validate().is_err());

        let bad_env = OrchestratorConfig {
            launch_env: vec!["DISPLAY".into()],
            ..Default::default()
        };
        assert!(bad_env.validate().is_err());
    }
}
