// target.rs -- Execution target and device configuration.
//
// A `Target` says where a compiled plan runs: the host OS and architecture,
// which accelerator API (if any) device-bound loops are dispatched through,
// and whether device dispatches and transfers are logged. A plan captures
// its target at compile time and never changes it.

use std::env::consts;
use std::fmt;

use crate::device::DeviceProfile;

/// Accelerator APIs a target can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceleratorApi {
    OpenCl,
    Metal,
    Cuda,
}

impl AcceleratorApi {
    /// Metal on macOS, OpenCL elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            AcceleratorApi::Metal
        } else {
            AcceleratorApi::OpenCl
        }
    }
}

impl fmt::Display for AcceleratorApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorApi::OpenCl => write!(f, "opencl"),
            AcceleratorApi::Metal => write!(f, "metal"),
            AcceleratorApi::Cuda => write!(f, "cuda"),
        }
    }
}

/// Configuration for the device path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// `None` picks the platform default.
    pub api: Option<AcceleratorApi>,
    /// Log every dispatch and transfer at info level.
    pub debug: bool,
    /// Limits the emulated accelerator enforces.
    pub profile: DeviceProfile,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            api: None,
            debug: false,
            profile: DeviceProfile::Native,
        }
    }
}

/// Where and how a plan executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub os: String,
    pub arch: String,
    pub accelerator: Option<AcceleratorApi>,
    pub debug: bool,
}

impl Target {
    /// The machine we are running on, host only.
    pub fn host() -> Self {
        Target {
            os: consts::OS.to_string(),
            arch: consts::ARCH.to_string(),
            accelerator: None,
            debug: false,
        }
    }

    /// The host target with the device path enabled per `config`.
    pub fn for_device(config: &DeviceConfig) -> Self {
        Target::host()
            .with_accelerator(config.api.unwrap_or_else(AcceleratorApi::platform_default))
            .with_debug(config.debug)
    }

    pub fn with_accelerator(mut self, api: AcceleratorApi) -> Self {
        self.accelerator = Some(api);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn has_accelerator(&self) -> bool {
        self.accelerator.is_some()
    }
}

impl Default for Target {
    fn default() -> Self {
        Target::host()
    }
}

/// `arch-os[-api][-debug]`, e.g. `x86_64-linux-opencl-debug`.
impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.arch, self.os)?;
        if let Some(api) = self.accelerator {
            write!(f, "-{api}")?;
        }
        if self.debug {
            write!(f, "-debug")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_target_has_no_accelerator() {
        let t = Target::host();
        assert!(!t.has_accelerator());
        assert!(!t.debug);
        assert_eq!(t.to_string(), format!("{}-{}", consts::ARCH, consts::OS));
    }

    #[test]
    fn device_target_debug_is_off_by_default() {
        let t = Target::for_device(&DeviceConfig::default());
        assert_eq!(t.accelerator, Some(AcceleratorApi::platform_default()));
        assert!(!t.debug);
    }

    #[test]
    fn display_lists_features() {
        let t = Target::host()
            .with_accelerator(AcceleratorApi::OpenCl)
            .with_debug(true);
        assert!(t.to_string().ends_with("-opencl-debug"));
    }
}
