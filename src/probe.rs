// probe.rs -- Is there a hardware accelerator on this machine?
//
// The device schedule only makes sense when the machine has a real GPU.
// `WgpuProbe` asks wgpu for its adapters and accepts the first one that is
// actual hardware:
//
//   DiscreteGpu / IntegratedGpu   real hardware           <- accept
//   VirtualGpu / Other            VM pass-through, layers <- accept
//   Cpu                           llvmpipe, softpipe, WARP <- reject
//
// Software rasterizers show up as valid adapters on many CI machines and
// in WSL2, so "an adapter exists" is not the same as "a GPU exists".
//
// `FixedProbe` answers a fixed value, for tests and for forcing the host
// path.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on` -- wgpu's adapter API is async (it maps onto JS
//   promises on the web); natively we just block on it.

use std::sync::OnceLock;

use tracing::{debug, info};

/// Answers whether device schedules can run here.
pub trait AcceleratorProbe {
    fn available(&self) -> bool;

    /// Name of the adapter found, or of the probe itself.
    fn name(&self) -> &str;
}

/// Probes wgpu once and caches the answer.
#[derive(Debug, Default)]
pub struct WgpuProbe {
    found: OnceLock<Option<String>>,
}

impl WgpuProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn adapter(&self) -> &Option<String> {
        self.found.get_or_init(|| {
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapters = instance.enumerate_adapters(wgpu::Backends::all());
            for a in &adapters {
                let info = a.get_info();
                debug!(name = %info.name, backend = ?info.backend, kind = ?info.device_type, "adapter");
            }
            let hardware = adapters
                .iter()
                .map(|a| a.get_info())
                .find(|info| info.device_type != wgpu::DeviceType::Cpu)
                .map(|info| info.name);

            // Fall back to the preferred adapter, in case enumeration is not
            // supported by the backend.
            let found = hardware.or_else(|| {
                let options = wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    force_fallback_adapter: false,
                    compatible_surface: None,
                };
                pollster::block_on(instance.request_adapter(&options))
                    .map(|a| a.get_info())
                    .filter(|info| info.device_type != wgpu::DeviceType::Cpu)
                    .map(|info| info.name)
            });
            match &found {
                Some(name) => info!(adapter = %name, "accelerator found"),
                None => info!("no hardware accelerator found"),
            }
            found
        })
    }
}

impl AcceleratorProbe for WgpuProbe {
    fn available(&self) -> bool {
        self.adapter().is_some()
    }

    fn name(&self) -> &str {
        self.adapter().as_deref().unwrap_or("none")
    }
}

/// A probe with a fixed answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedProbe(pub bool);

impl AcceleratorProbe for FixedProbe {
    fn available(&self) -> bool {
        self.0
    }

    fn name(&self) -> &str {
        if self.0 {
            "fixed (available)"
        } else {
            "fixed (unavailable)"
        }
    }
}

/// Shorthand for `WgpuProbe::new().available()`.
pub fn accelerator_available() -> bool {
    WgpuProbe::new().available()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_probe_answers_its_value() {
        assert!(FixedProbe(true).available());
        assert!(!FixedProbe(false).available());
        assert_eq!(FixedProbe(false).name(), "fixed (unavailable)");
    }

    #[test]
    #[ignore = "requires a GPU"]
    fn wgpu_probe_finds_hardware() {
        let probe = WgpuProbe::new();
        assert!(probe.available(), "no hardware adapter found");
        println!("adapter: {}", probe.name());
    }
}
