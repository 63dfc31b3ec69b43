//! GPU device descriptions and device selector matching.
//!
//! Devices are enumerated by the native engine; this module only describes
//! them and implements the selector strings accepted by
//! `llmodel_gpu_init_gpu_device_by_string`.

use serde::{Deserialize, Serialize};

/// Physical device type codes reported by the engine (Vulkan numbering).
pub const DEVICE_TYPE_INTEGRATED: i32 = 1;
pub const DEVICE_TYPE_DISCRETE: i32 = 2;

/// Information about a single GPU device (mirrors `llmodel_gpu_device`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    /// Device index as understood by the engine.
    pub index: i32,

    /// Physical device type.
    #[serde(rename = "type")]
    pub device_type: i32,

    /// Size of the largest device-local heap in bytes.
    pub heap_size: usize,

    /// Device name (e.g., "NVIDIA GeForce GTX 1070").
    pub name: String,

    /// Vendor string (e.g., "nvidia", "amd", "intel").
    pub vendor: String,
}

impl GpuDevice {
    pub fn is_discrete(&self) -> bool {
        self.device_type == DEVICE_TYPE_DISCRETE
    }
}

/// A parsed device selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Run on the CPU; never matches a GPU.
    Cpu,
    /// Best available GPU.
    AnyGpu,
    /// First device from a vendor.
    Vendor(String),
    /// Exact device name.
    Name(String),
}

impl DeviceSelector {
    pub fn parse(selector: &str) -> Self {
        let lowered = selector.trim().to_lowercase();
        match lowered.as_str() {
            "cpu" => DeviceSelector::Cpu,
            "gpu" => DeviceSelector::AnyGpu,
            "amd" | "nvidia" | "intel" => DeviceSelector::Vendor(lowered),
            _ => DeviceSelector::Name(selector.trim().to_string()),
        }
    }

    /// Pick the device this selector refers to, if any.
    ///
    /// `AnyGpu` prefers discrete devices, then the largest heap.
    pub fn select<'a>(&self, devices: &'a [GpuDevice]) -> Option<&'a GpuDevice> {
        match self {
            DeviceSelector::Cpu => None,
            DeviceSelector::AnyGpu => devices
                .iter()
                .max_by_key(|d| (d.is_discrete(), d.heap_size)),
            DeviceSelector::Vendor(vendor) => devices
                .iter()
                .find(|d| d.vendor.eq_ignore_ascii_case(vendor)),
            DeviceSelector::Name(name) => devices.iter().find(|d| d.name == *name),
        }
    }
}

/// Two identical 8 GiB discrete NVIDIA cards.
pub fn stub_devices_dual_gtx1070() -> Vec<GpuDevice> {
    vec![
        GpuDevice {
            index: 0,
            device_type: DEVICE_TYPE_DISCRETE,
            heap_size: 8 * 1024 * 1024 * 1024,
            name: "NVIDIA GeForce GTX 1070".to_string(),
            vendor: "nvidia".to_string(),
        },
        GpuDevice {
            index: 1,
            device_type: DEVICE_TYPE_DISCRETE,
            heap_size: 8 * 1024 * 1024 * 1024,
            name: "NVIDIA GeForce GTX 1070".to_string(),
            vendor: "nvidia".to_string(),
        },
    ]
}

/// A laptop with an integrated Intel GPU and a small discrete AMD card.
pub fn stub_devices_laptop() -> Vec<GpuDevice> {
    vec![
        GpuDevice {
            index: 0,
            device_type: DEVICE_TYPE_INTEGRATED,
            heap_size: 2 * 1024 * 1024 * 1024,
            name: "Intel(R) Iris(R) Xe Graphics".to_string(),
            vendor: "intel".to_string(),
        },
        GpuDevice {
            index: 1,
            device_type: DEVICE_TYPE_DISCRETE,
            heap_size: 4 * 1024 * 1024 * 1024,
            name: "AMD Radeon RX 6500M".to_string(),
            vendor: "amd".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selectors() {
        assert_eq!(DeviceSelector::parse("CPU"), DeviceSelector::Cpu);
        assert_eq!(DeviceSelector::parse("gpu"), DeviceSelector::AnyGpu);
        assert_eq!(
            DeviceSelector::parse("Nvidia"),
            DeviceSelector::Vendor("nvidia".to_string())
        );
        assert_eq!(
            DeviceSelector::parse("AMD Radeon RX 6500M"),
            DeviceSelector::Name("AMD Radeon RX 6500M".to_string())
        );
    }

    #[test]
    fn test_any_gpu_prefers_discrete() {
        let devices = stub_devices_laptop();
        let picked = DeviceSelector::AnyGpu.select(&devices).unwrap();
        assert_eq!(picked.vendor, "amd");
    }

    #[test]
    fn test_unmatched_selectors() {
        let devices = stub_devices_dual_gtx1070();
        assert!(DeviceSelector::Cpu.select(&devices).is_none());
        assert!(DeviceSelector::parse("amd").select(&devices).is_none());
        assert!(DeviceSelector::AnyGpu.select(&[]).is_none());
    }

    #[test]
    fn test_serializes_with_host_field_names() {
        let json = serde_json::to_value(&stub_devices_dual_gtx1070()[0]).unwrap();
        assert_eq!(json["type"], DEVICE_TYPE_DISCRETE);
        assert!(json.get("heapSize").is_some());
    }
}
