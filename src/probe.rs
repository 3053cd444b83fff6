//! Host Probe (C1): inspects the host once at session start and reports
//! architecture, available VMMs, available compilers, and hypervisor
//! support. Runs once, read-only thereafter (spec.md §3 lifecycles).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{ToolSpec, ToolsConfig};
use crate::error::UkError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLocation {
    pub path: PathBuf,
}

/// Observed capabilities of the host machine. Immutable after `probe()`
/// returns.
#[derive(Debug, Clone, Default)]
pub struct HostCapabilities {
    pub architecture: String,
    pub vmms: HashMap<String, ToolLocation>,
    pub compilers: HashMap<String, ToolLocation>,
    pub hypervisor_kvm: bool,
    pub hypervisor_xen: bool,
}

impl HostCapabilities {
    pub fn has_vmm(&self, name: &str) -> bool {
        name == "none" || self.vmms.contains_key(name)
    }

    pub fn has_compiler(&self, name: &str) -> bool {
        self.compilers.contains_key(name)
    }
}

/// Canonical PATH executable name for a VMM on a given architecture.
/// A tool absent from this table (or absent on PATH) is simply dropped
/// from the capability set — per-tool probe failure is non-fatal.
fn canonical_executable(tool_name: &str, architecture: &str) -> Option<String> {
    match tool_name {
        "qemu" => Some(format!("qemu-system-{architecture}")),
        "xen" => Some("xl".to_string()),
        "firecracker" => Some("firecracker".to_string()),
        other => Some(other.to_string()),
    }
}

fn resolve_tool(
    name: &str,
    spec: &ToolSpec,
    architecture: &str,
) -> Option<(String, ToolLocation)> {
    match spec {
        ToolSpec::Explicit { path, .. } => {
            if path.exists() {
                Some((name.to_string(), ToolLocation { path: path.clone() }))
            } else {
                warn!(tool = name, path = %path.display(), "configured tool path does not exist");
                None
            }
        }
        ToolSpec::System(_) => {
            let exe = canonical_executable(name, architecture)?;
            match which::which(&exe) {
                Ok(path) => Some((name.to_string(), ToolLocation { path })),
                Err(_) => {
                    debug!(tool = name, exe = %exe, "tool not found on PATH");
                    None
                }
            }
        }
    }
}

fn probe_tools(
    table: &HashMap<String, ToolSpec>,
    architecture: &str,
) -> HashMap<String, ToolLocation> {
    table
        .iter()
        .filter_map(|(name, spec)| resolve_tool(name, spec, architecture))
        .collect()
}

fn detect_kvm() -> bool {
    Path::new("/dev/kvm").exists()
}

fn detect_xen() -> bool {
    Path::new("/proc/xen/privcmd").exists() || Path::new("/dev/xen/privcmd").exists()
}

fn host_architecture() -> Result<String, UkError> {
    let arch = std::env::consts::ARCH;
    if arch.is_empty() {
        return Err(UkError::Probe(
            "could not determine host architecture".to_string(),
        ));
    }
    Ok(arch.to_string())
}

/// Probes the host once. Only a failure to determine the architecture is
/// fatal; every other tool absence is absorbed into the capability set.
pub fn probe(tools: &ToolsConfig) -> Result<HostCapabilities, UkError> {
    let architecture = host_architecture()?;
    let vmms = probe_tools(&tools.vmm, &architecture);
    let compilers = probe_tools(&tools.compiler, &architecture);
    let hypervisor_kvm = detect_kvm();
    let hypervisor_xen = detect_xen();

    debug!(
        architecture = %architecture,
        vmms = vmms.len(),
        compilers = compilers.len(),
        hypervisor_kvm,
        hypervisor_xen,
        "host probe complete"
    );

    Ok(HostCapabilities {
        architecture,
        vmms,
        compilers,
        hypervisor_kvm,
        hypervisor_xen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_executable_names_qemu_per_arch() {
        assert_eq!(
            canonical_executable("qemu", "x86_64"),
            Some("qemu-system-x86_64".to_string())
        );
        assert_eq!(
            canonical_executable("qemu", "arm64"),
            Some("qemu-system-arm64".to_string())
        );
    }

    #[test]
    fn has_vmm_treats_none_as_always_present() {
        let caps = HostCapabilities::default();
        assert!(caps.has_vmm("none"));
        assert!(!caps.has_vmm("qemu"));
    }

    #[test]
    fn explicit_tool_path_must_exist() {
        let spec = ToolSpec::Explicit {
            arch: "x86_64".to_string(),
            kind: "qemu".to_string(),
            path: PathBuf::from("/nonexistent/qemu-system-x86_64"),
        };
        assert!(resolve_tool("qemu", &spec, "x86_64").is_none());
    }
}
