// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource registry — computational resources available to instances.
//!
//! The registry is computed once per process and read-only afterwards. It
//! never owns computation; it is a lookup service that instance creation
//! scans in order. Entry 0 is always the scalar CPU. A vectorized CPU
//! entry follows when the host advertises SSE2 (read from `/proc/cpuinfo`,
//! with a compile-target fallback). GPU adapters are enumerated through
//! wgpu when the `gpu` feature is enabled; only adapters with `SHADER_F64`
//! are listed, since every kernel here computes in double precision.

use crate::flags::Flags;
use std::fs;
use std::sync::OnceLock;

/// One computational resource.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Human-readable device name.
    pub name: String,
    /// Capability bits of this resource.
    pub flags: Flags,
    pub(crate) kind: ResourceKind,
}

/// What backend a resource maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceKind {
    CpuScalar,
    CpuVector,
    #[cfg(feature = "gpu")]
    Gpu {
        adapter_index: usize,
    },
}

static REGISTRY: OnceLock<Vec<Resource>> = OnceLock::new();

/// The ordered resource list for this process.
#[must_use]
pub fn resources() -> &'static [Resource] {
    REGISTRY.get_or_init(discover)
}

fn discover() -> Vec<Resource> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    let cpu_name = parse_model_name(&cpuinfo).unwrap_or_else(|| String::from("Unknown CPU"));

    let mut list = vec![Resource {
        name: format!("{cpu_name} (scalar)"),
        flags: Flags::CPU | Flags::DOUBLE | Flags::SYNCH,
        kind: ResourceKind::CpuScalar,
    }];

    if has_sse2(&cpuinfo) {
        list.push(Resource {
            name: format!("{cpu_name} (SSE)"),
            flags: Flags::CPU | Flags::SSE | Flags::DOUBLE | Flags::SYNCH,
            kind: ResourceKind::CpuVector,
        });
    }

    #[cfg(feature = "gpu")]
    list.extend(probe_gpus());

    list
}

fn parse_model_name(cpuinfo: &str) -> Option<String> {
    cpuinfo
        .lines()
        .find(|l| l.starts_with("model name"))
        .and_then(|l| l.split(':').nth(1))
        .map(|s| s.trim().to_string())
}

fn has_sse2(cpuinfo: &str) -> bool {
    let listed = cpuinfo
        .lines()
        .filter(|l| l.starts_with("flags"))
        .any(|l| l.split_whitespace().any(|f| f == "sse2"));
    // /proc/cpuinfo is Linux-only; fall back to the compile target.
    listed || cfg!(target_feature = "sse2")
}

/// Enumerate wgpu adapters with f64 shader support.
#[cfg(feature = "gpu")]
fn probe_gpus() -> Vec<Resource> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let mut gpus = Vec::new();
    for (idx, adapter) in instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .enumerate()
    {
        let info = adapter.get_info();
        if info.device_type == wgpu::DeviceType::Cpu {
            continue;
        }
        if !adapter.features().contains(wgpu::Features::SHADER_F64) {
            continue;
        }
        gpus.push(Resource {
            name: info.name.clone(),
            flags: Flags::GPU | Flags::DOUBLE | Flags::ASYNCH,
            kind: ResourceKind::Gpu { adapter_index: idx },
        });
    }
    gpus
}
