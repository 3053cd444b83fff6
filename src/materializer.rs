//! Script Materializer (C4): renders a build script, a run script, and a
//! case-local config file for each case from templates parameterized by
//! the case's variant assignment. Templates are pure functions of the
//! case data — they never consult external state at render time (spec.md
//! §4.4), matching the teacher's handlebars usage in
//! `sx9-smart-crate-orchestrator/src/templates.rs`.

use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::matrix::{TargetCase, AXIS_ARCHITECTURE, AXIS_BUILD_TOOL, AXIS_HYPERVISOR, AXIS_NETWORKING, AXIS_PLATFORM, AXIS_ROOTFS, AXIS_RUN_TOOL};
use crate::error::UkError;
use crate::probe::HostCapabilities;

const COMMON_SH: &str = r#"#!/bin/sh
# Shared helpers sourced by every generated build/run script in this session.
set -eu

log() {
    printf '[%s] %s\n' "$(date +%H:%M:%S)" "$1"
}

die() {
    log "FATAL: $1"
    exit 1
}
"#;

const BUILD_SH_MAKE: &str = r#"#!/bin/sh
. "{{common_sh}}"
set -eu

log "configuring defconfig for case {{case_index}} ({{case_id}})"
cat > "{{case_dir}}/defconfig" <<'EOF'
CONFIG_UK_ARCH_{{architecture}}=y
CONFIG_UK_PLATFORM_{{platform}}=y
CONFIG_UK_BOOTLOADER_{{bootloader}}=y
CONFIG_UK_PIE={{pie}}
CONFIG_UK_DEBUG={{debug_level}}
EOF

log "building with make ({{compiler_path}})"
cd "{{app_dir}}"
make defconfig CONFIG="{{case_dir}}/defconfig"
make CC="{{compiler_path}}" -j"$(nproc)"
cp "{{app_dir}}/build/{{app_name}}_{{platform}}-{{architecture}}" "{{case_dir}}/{{kernel_image_name}}"
log "kernel image placed at {{case_dir}}/{{kernel_image_name}}"
"#;

const BUILD_SH_INTEGRATED: &str = r#"#!/bin/sh
. "{{common_sh}}"
set -eu

log "writing tool manifest for case {{case_index}} ({{case_id}})"
cat > "{{case_dir}}/Kraftfile" <<'EOF'
spec: v0.6
name: {{app_name}}
unikraft:
  arch: {{architecture}}
  plat: {{platform}}
targets:
  - {{platform}}/{{architecture}}
EOF

log "building with {{build_tool}} ({{build_tool_path}})"
cd "{{app_dir}}"
"{{build_tool_path}}" build --manifest "{{case_dir}}/Kraftfile" --plat {{platform}} --arch {{architecture}}
cp "{{app_dir}}/.unikraft/build/{{app_name}}_{{platform}}-{{architecture}}" "{{case_dir}}/{{kernel_image_name}}"
log "kernel image placed at {{case_dir}}/{{kernel_image_name}}"
"#;

const RUN_SH: &str = r#"#!/bin/sh
. "{{common_sh}}"
set -eu

cleanup() {
    {{#if networking_enabled}}
    ip link delete "{{bridge_name}}" 2>/dev/null || true
    {{/if}}
    {{#if rootfs_enabled}}
    umount "{{case_dir}}/rootfs-mount" 2>/dev/null || true
    {{/if}}
}
trap cleanup EXIT INT TERM

{{#if networking_enabled}}
log "setting up network plumbing on {{bridge_name}}"
ip tuntap add dev "{{bridge_name}}" mode tap
ip link set "{{bridge_name}}" up
{{/if}}

{{#if rootfs_enabled}}
log "preparing rootfs ({{rootfs_kind}})"
mkdir -p "{{case_dir}}/rootfs-mount"
{{/if}}

log "launching under {{run_tool}} (hypervisor={{hypervisor}})"
VMM_ARGS="-kernel {{case_dir}}/{{kernel_image_name}} -m {{memory}}"
{{#if networking_enabled}}
VMM_ARGS="$VMM_ARGS -netdev tap,id=net0,ifname={{bridge_name}},script=no -device virtio-net-device,netdev=net0"
{{/if}}
{{#if networking_enabled}}
{{#each ports}}
VMM_ARGS="$VMM_ARGS -device virtio-net-device,portfwd=${UKHARNESS_PORT_{{@index}}}"
{{/each}}
{{/if}}

# stdout/stderr of this script are captured by the executor into run.log.
"{{run_tool_path}}" $VMM_ARGS
"#;

const CASE_CONFIG_YAML: &str = r#"case_index: {{case_index}}
case_id: {{case_id}}
assignment:
{{#each assignment}}
  {{@key}}: {{this}}
{{/each}}
memory: {{memory}}
ports: [{{#each ports}}{{this}}{{#unless @last}}, {{/unless}}{{/each}}]
rootfs_kind: {{rootfs_kind}}
requires_networking: {{requires_networking}}
test_command: {{test_command}}
success_marker: {{success_marker}}
"#;

#[derive(Serialize)]
struct BuildContext {
    case_index: usize,
    case_id: String,
    case_dir: String,
    common_sh: String,
    app_dir: String,
    app_name: String,
    architecture: String,
    platform: String,
    bootloader: String,
    pie: String,
    debug_level: String,
    build_tool: String,
    build_tool_path: String,
    compiler_path: String,
    kernel_image_name: String,
}

#[derive(Serialize)]
struct RunContext {
    case_dir: String,
    common_sh: String,
    session_name: String,
    run_tool: String,
    run_tool_path: String,
    hypervisor: String,
    memory: String,
    ports: Vec<u16>,
    networking_enabled: bool,
    bridge_name: String,
    rootfs_enabled: bool,
    rootfs_kind: String,
    kernel_image_name: String,
}

#[derive(Serialize)]
struct CaseConfigContext {
    case_index: usize,
    case_id: String,
    assignment: std::collections::BTreeMap<String, String>,
    memory: String,
    ports: Vec<u16>,
    rootfs_kind: String,
    requires_networking: bool,
    test_command: String,
    success_marker: String,
}

pub struct Materializer {
    hbs: Handlebars<'static>,
}

pub const KERNEL_IMAGE_NAME: &str = "kernel.img";

impl Materializer {
    pub fn new() -> Result<Self, UkError> {
        let mut hbs = Handlebars::new();
        hbs.set_strict_mode(true);
        hbs.register_template_string("build_make", BUILD_SH_MAKE)
            .map_err(|e| UkError::Layout(format!("registering build_make template: {e}")))?;
        hbs.register_template_string("build_integrated", BUILD_SH_INTEGRATED)
            .map_err(|e| UkError::Layout(format!("registering build_integrated template: {e}")))?;
        hbs.register_template_string("run", RUN_SH)
            .map_err(|e| UkError::Layout(format!("registering run template: {e}")))?;
        hbs.register_template_string("config", CASE_CONFIG_YAML)
            .map_err(|e| UkError::Layout(format!("registering config template: {e}")))?;
        Ok(Materializer { hbs })
    }

    /// Renders `config.yaml`, `build`, and `run` into `case_dir`, plus the
    /// `defconfig`/tool-manifest file the build branch needs. Idempotent:
    /// re-running with identical inputs overwrites with byte-identical
    /// output (spec.md §8, testable property 5).
    pub fn materialize(
        &self,
        case: &TargetCase,
        case_dir: &Path,
        app_dir: &Path,
        app_name: &str,
        app: &AppConfig,
        host: &HostCapabilities,
        session_name: &str,
        common_sh: &Path,
        bridge_name: &str,
    ) -> Result<(), UkError> {
        let architecture = case.value(AXIS_ARCHITECTURE).unwrap_or("unknown").to_string();
        let platform = case.value(AXIS_PLATFORM).unwrap_or("unknown").to_string();
        let build_tool = case.value(AXIS_BUILD_TOOL).unwrap_or("make").to_string();
        let run_tool = case.value(AXIS_RUN_TOOL).unwrap_or("qemu").to_string();
        let hypervisor = case.value(AXIS_HYPERVISOR).unwrap_or("none").to_string();
        let networking = case.value(AXIS_NETWORKING).unwrap_or("none").to_string();
        let rootfs = case.value(AXIS_ROOTFS).unwrap_or("none").to_string();
        let bootloader = case.value("bootloader").unwrap_or("default").to_string();
        let pie = case.value("pie").unwrap_or("n").to_string();
        let debug_level = case.value("debug_level").unwrap_or("release").to_string();

        let compiler_path = host
            .compilers
            .get(&architecture)
            .map(|t| t.path.display().to_string())
            .unwrap_or_else(|| "cc".to_string());
        let build_tool_path = host
            .vmms
            .get(&build_tool)
            .or_else(|| host.compilers.get(&build_tool))
            .map(|t| t.path.display().to_string())
            .unwrap_or_else(|| build_tool.clone());
        let run_tool_path = host
            .vmms
            .get(&run_tool)
            .map(|t| t.path.display().to_string())
            .unwrap_or_else(|| run_tool.clone());

        let memory = app.runtime.memory.clone().unwrap_or_else(|| "256M".to_string());
        let ports = app.runtime.ports.clone();
        let rootfs_kind = app.runtime.rootfs_kind.clone().unwrap_or_else(|| rootfs.clone());
        let test_command = app.runtime.test_command.clone().unwrap_or_default();
        let success_marker = app.runtime.success_marker.clone().unwrap_or_default();

        let build_ctx = BuildContext {
            case_index: case.index,
            case_id: case.id.clone(),
            case_dir: case_dir.display().to_string(),
            common_sh: common_sh.display().to_string(),
            app_dir: app_dir.display().to_string(),
            app_name: app_name.to_string(),
            architecture: architecture.clone(),
            platform: platform.clone(),
            bootloader,
            pie,
            debug_level,
            build_tool: build_tool.clone(),
            build_tool_path,
            compiler_path,
            kernel_image_name: KERNEL_IMAGE_NAME.to_string(),
        };

        let template_name = if build_tool == "make" {
            "build_make"
        } else {
            "build_integrated"
        };
        let build_script = self
            .hbs
            .render(template_name, &build_ctx)
            .map_err(|e| UkError::Layout(format!("rendering build script: {e}")))?;
        write_executable(&case_dir.join("build"), &build_script)?;

        let run_ctx = RunContext {
            case_dir: case_dir.display().to_string(),
            common_sh: common_sh.display().to_string(),
            session_name: session_name.to_string(),
            run_tool,
            run_tool_path,
            hypervisor,
            memory: memory.clone(),
            ports: ports.clone(),
            networking_enabled: networking != "none",
            bridge_name: bridge_name.to_string(),
            rootfs_enabled: rootfs != "none",
            rootfs_kind: rootfs_kind.clone(),
            kernel_image_name: KERNEL_IMAGE_NAME.to_string(),
        };
        let run_script = self
            .hbs
            .render("run", &run_ctx)
            .map_err(|e| UkError::Layout(format!("rendering run script: {e}")))?;
        write_executable(&case_dir.join("run"), &run_script)?;

        let config_ctx = CaseConfigContext {
            case_index: case.index,
            case_id: case.id.clone(),
            assignment: case.assignment.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            memory,
            ports,
            rootfs_kind,
            requires_networking: app.runtime.requires_networking,
            test_command,
            success_marker,
        };
        let config_yaml = self
            .hbs
            .render("config", &config_ctx)
            .map_err(|e| UkError::Layout(format!("rendering case config: {e}")))?;
        std::fs::write(case_dir.join("config.yaml"), config_yaml)
            .map_err(|e| UkError::Layout(format!("writing config.yaml: {e}")))?;

        debug!(case_index = case.index, "case materialized");
        Ok(())
    }
}

pub fn write_common_sh(path: &Path) -> Result<(), UkError> {
    std::fs::write(path, COMMON_SH).map_err(|e| UkError::Layout(format!("writing common.sh: {e}")))?;
    set_executable(path)?;
    Ok(())
}

fn write_executable(path: &Path, content: &str) -> Result<(), UkError> {
    std::fs::write(path, content).map_err(|e| {
        UkError::Layout(format!("writing {}: {e}", path.display()))
    })?;
    set_executable(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), UkError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .map_err(|e| UkError::Layout(format!("stat {}: {e}", path.display())))?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
        .map_err(|e| UkError::Layout(format!("chmod {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), UkError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, AppType, RuntimeConfig};
    use indexmap::indexmap;
    use tempfile::tempdir;

    fn sample_case() -> TargetCase {
        TargetCase {
            index: 1,
            id: "x86_64-qemu".to_string(),
            assignment: indexmap! {
                "architecture".to_string() => "x86_64".to_string(),
                "platform".to_string() => "qemu".to_string(),
                "build_tool".to_string() => "make".to_string(),
                "run_tool".to_string() => "qemu".to_string(),
                "hypervisor".to_string() => "kvm".to_string(),
                "networking".to_string() => "tap".to_string(),
                "rootfs".to_string() => "initrd".to_string(),
            },
        }
    }

    fn sample_app() -> AppConfig {
        AppConfig {
            targets: vec![],
            runtime: RuntimeConfig {
                memory: Some("128M".to_string()),
                ports: vec![8080],
                rootfs_kind: Some("initrd".to_string()),
                requires_networking: true,
                forbids_networking: false,
                requires_filesystem: true,
                forbids_filesystem: false,
                test_command: Some("run-tests".to_string()),
                success_marker: Some("ALL TESTS PASSED".to_string()),
            },
            app_type: AppType::KernelImage,
            override_script: None,
        }
    }

    #[test]
    fn materializes_all_three_artifacts() {
        let dir = tempdir().unwrap();
        let case_dir = dir.path().join("1");
        std::fs::create_dir_all(&case_dir).unwrap();
        let materializer = Materializer::new().unwrap();

        materializer
            .materialize(
                &sample_case(),
                &case_dir,
                &dir.path().join("app"),
                "demo-app",
                &sample_app(),
                &HostCapabilities::default(),
                "session",
                &dir.path().join("common.sh"),
                "uktap1",
            )
            .unwrap();

        assert!(case_dir.join("build").is_file());
        assert!(case_dir.join("run").is_file());
        assert!(case_dir.join("config.yaml").is_file());

        let config = std::fs::read_to_string(case_dir.join("config.yaml")).unwrap();
        assert!(config.contains("case_index: 1"));
        assert!(config.contains("architecture: x86_64"));
    }

    /// Testable property 5 in spec.md §8: re-materializing is byte-identical.
    #[test]
    fn materialization_is_idempotent() {
        let dir = tempdir().unwrap();
        let case_dir = dir.path().join("1");
        std::fs::create_dir_all(&case_dir).unwrap();
        let materializer = Materializer::new().unwrap();
        let case = sample_case();
        let app = sample_app();
        let host = HostCapabilities::default();

        for _ in 0..2 {
            materializer
                .materialize(
                    &case,
                    &case_dir,
                    &dir.path().join("app"),
                    "demo-app",
                    &app,
                    &host,
                    "session",
                    &dir.path().join("common.sh"),
                    "uktap1",
                )
                .unwrap();
        }

        let build1 = std::fs::read_to_string(case_dir.join("build")).unwrap();
        materializer
            .materialize(
                &case,
                &case_dir,
                &dir.path().join("app"),
                "demo-app",
                &app,
                &host,
                "session",
                &dir.path().join("common.sh"),
                "uktap1",
            )
            .unwrap();
        let build2 = std::fs::read_to_string(case_dir.join("build")).unwrap();
        assert_eq!(build1, build2);
    }
}
