//! Matrix Engine (C2): expands the declarative build/run axes into the
//! Cartesian product, prunes by exclusion rules, then by host capabilities,
//! then by the application's declared targets, and finally indexes the
//! survivors densely from 1.
//!
//! Conventional axis names this engine looks for when applying the host
//! and application overrides (step 3-5 of spec.md §4.2): `architecture`,
//! `platform`, `build_tool`, `run_tool`, `hypervisor`, `networking`,
//! `rootfs`. An axis declaration is free to omit any of these; checks
//! against a missing axis are simply skipped. See DESIGN.md for the
//! resolution of the open question on how `build_tool`/`run_tool`
//! requirements map onto the probed tool tables.

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, GlobalConfig, RuleAtom};
use crate::error::MatrixError;
use crate::probe::HostCapabilities;

pub const AXIS_ARCHITECTURE: &str = "architecture";
pub const AXIS_PLATFORM: &str = "platform";
pub const AXIS_BUILD_TOOL: &str = "build_tool";
pub const AXIS_RUN_TOOL: &str = "run_tool";
pub const AXIS_HYPERVISOR: &str = "hypervisor";
pub const AXIS_NETWORKING: &str = "networking";
pub const AXIS_ROOTFS: &str = "rootfs";

pub type VariantAssignment = IndexMap<String, String>;

#[derive(Debug, Clone)]
pub struct Axis {
    pub name: String,
    pub levels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TargetCase {
    pub index: usize,
    pub id: String,
    pub assignment: VariantAssignment,
}

impl TargetCase {
    pub fn value(&self, axis: &str) -> Option<&str> {
        self.assignment.get(axis).map(String::as_str)
    }
}

fn declared_axes(global: &GlobalConfig) -> Result<Vec<Axis>, MatrixError> {
    let mut axes = Vec::new();
    for (name, levels) in global.variants.build.iter().chain(global.variants.run.iter()) {
        if levels.is_empty() {
            return Err(MatrixError::EmptyAxis(name.clone()));
        }
        axes.push(Axis {
            name: name.clone(),
            levels: levels.clone(),
        });
    }
    Ok(axes)
}

/// Cartesian product of all axis levels, iterating lexicographically by
/// declaration order (first-declared axis is the most significant/outer
/// loop). This loop order defines the eventual case index.
fn expand(axes: &[Axis]) -> Vec<VariantAssignment> {
    let mut assignments = vec![VariantAssignment::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(assignments.len() * axis.levels.len());
        for partial in &assignments {
            for level in &axis.levels {
                let mut extended = partial.clone();
                extended.insert(axis.name.clone(), level.clone());
                next.push(extended);
            }
        }
        assignments = next;
    }
    assignments
}

fn axis_by_name<'a>(axes: &'a [Axis], name: &str) -> Option<&'a Axis> {
    axes.iter().find(|a| a.name == name)
}

/// Evaluates one atom of a rule's conjunction against an assignment.
/// Returns `Err` if the atom references an axis or level that was never
/// declared (spec.md `MatrixError::UnknownAxisOrLevel`).
fn atom_matches(
    axes: &[Axis],
    axis_name: &str,
    atom: &RuleAtom,
    assignment: &VariantAssignment,
) -> Result<bool, MatrixError> {
    let axis = axis_by_name(axes, axis_name)
        .ok_or_else(|| MatrixError::UnknownAxisOrLevel(axis_name.to_string()))?;
    let assigned = assignment
        .get(axis_name)
        .expect("every declared axis is present in a well-formed assignment");

    let check_level = |level: &str| -> Result<(), MatrixError> {
        if axis.levels.iter().any(|l| l == level) {
            Ok(())
        } else {
            Err(MatrixError::UnknownAxisOrLevel(format!(
                "{axis_name}={level}"
            )))
        }
    };

    match atom {
        RuleAtom::Single(raw) => {
            if let Some(level) = raw.strip_prefix("not ") {
                check_level(level)?;
                Ok(assigned != level)
            } else {
                check_level(raw)?;
                Ok(assigned == raw)
            }
        }
        RuleAtom::List(items) => {
            if items.first().map(String::as_str) == Some("not") {
                let set = &items[1..];
                for level in set {
                    check_level(level)?;
                }
                Ok(!set.iter().any(|l| l == assigned))
            } else {
                for level in items {
                    check_level(level)?;
                }
                Ok(items.iter().any(|l| l == assigned))
            }
        }
    }
}

/// A rule fires (and the assignment is excluded) iff every atom in its
/// conjunction matches.
fn rule_fires(
    axes: &[Axis],
    rule: &IndexMap<String, RuleAtom>,
    assignment: &VariantAssignment,
) -> Result<bool, MatrixError> {
    for (axis_name, atom) in rule {
        if !atom_matches(axes, axis_name, atom, assignment)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn prune_exclusions(
    axes: &[Axis],
    rules: &[IndexMap<String, RuleAtom>],
    assignments: Vec<VariantAssignment>,
) -> Result<Vec<VariantAssignment>, MatrixError> {
    let mut survivors = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let mut excluded = false;
        for rule in rules {
            if rule_fires(axes, rule, &assignment)? {
                excluded = true;
                break;
            }
        }
        if !excluded {
            survivors.push(assignment);
        }
    }
    Ok(survivors)
}

/// `build_tool`/`run_tool` levels are satisfied either by a baseline level
/// that needs no external tool (`"none"`, `"make"`) or by appearing in the
/// probed VMM/compiler tables (see module docs: this crate treats both
/// `tools.vmm` entries as covering run-tool *and* build-tool names, since
/// the global config only exposes a `vmm` and a `compiler` table).
fn tool_satisfied(level: &str, host: &HostCapabilities) -> bool {
    level == "none" || level == "make" || host.vmms.contains_key(level) || host.compilers.contains_key(level)
}

fn prune_by_host(
    axes: &[Axis],
    host: &HostCapabilities,
    assignments: Vec<VariantAssignment>,
) -> Vec<VariantAssignment> {
    let has_axis = |name: &str| axis_by_name(axes, name).is_some();

    assignments
        .into_iter()
        .filter(|a| {
            if has_axis(AXIS_RUN_TOOL) {
                if let Some(run_tool) = a.get(AXIS_RUN_TOOL) {
                    if !tool_satisfied(run_tool, host) {
                        return false;
                    }
                }
            }
            if has_axis(AXIS_BUILD_TOOL) {
                if let Some(build_tool) = a.get(AXIS_BUILD_TOOL) {
                    if !tool_satisfied(build_tool, host) {
                        return false;
                    }
                }
            }
            if has_axis(AXIS_HYPERVISOR) {
                if let Some(hv) = a.get(AXIS_HYPERVISOR) {
                    let supported = match hv.as_str() {
                        "none" => true,
                        "kvm" => host.hypervisor_kvm,
                        "xen" => host.hypervisor_xen,
                        _ => false,
                    };
                    if !supported {
                        return false;
                    }
                }
            }
            if has_axis(AXIS_ARCHITECTURE) {
                if let Some(arch) = a.get(AXIS_ARCHITECTURE) {
                    if arch != &host.architecture && !host.compilers.contains_key(arch) {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

fn prune_by_app_targets(
    axes: &[Axis],
    app: &AppConfig,
    assignments: Vec<VariantAssignment>,
) -> Vec<VariantAssignment> {
    let has_both = axis_by_name(axes, AXIS_ARCHITECTURE).is_some()
        && axis_by_name(axes, AXIS_PLATFORM).is_some();
    if !has_both {
        return assignments;
    }
    assignments
        .into_iter()
        .filter(|a| {
            let arch = a.get(AXIS_ARCHITECTURE).map(String::as_str);
            let platform = a.get(AXIS_PLATFORM).map(String::as_str);
            match (arch, platform) {
                (Some(arch), Some(platform)) => app.targets.iter().any(|t| {
                    t.architecture == arch && t.platform == platform
                }),
                _ => true,
            }
        })
        .collect()
}

fn apply_app_overrides(
    axes: &[Axis],
    app: &AppConfig,
    assignments: Vec<VariantAssignment>,
) -> Vec<VariantAssignment> {
    let networking_declared = axis_by_name(axes, AXIS_NETWORKING).is_some();
    let rootfs_declared = axis_by_name(axes, AXIS_ROOTFS).is_some();

    assignments
        .into_iter()
        .filter(|a| {
            if networking_declared {
                if let Some(net) = a.get(AXIS_NETWORKING) {
                    if app.runtime.requires_networking && net == "none" {
                        return false;
                    }
                    if app.runtime.forbids_networking && net != "none" {
                        return false;
                    }
                }
            }
            if rootfs_declared {
                if let Some(rootfs) = a.get(AXIS_ROOTFS) {
                    if app.runtime.requires_filesystem && rootfs == "none" {
                        return false;
                    }
                    if app.runtime.forbids_filesystem && rootfs != "none" {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

fn make_id(assignment: &VariantAssignment) -> String {
    assignment
        .values()
        .cloned()
        .collect::<Vec<_>>()
        .join("-")
}

/// Runs the full C2 pipeline: expand, prune by exclusions, prune by host,
/// intersect with application targets, apply application-derived
/// overrides, then index densely from 1.
pub fn build_target_cases(
    global: &GlobalConfig,
    host: &HostCapabilities,
    app: &AppConfig,
) -> Result<Vec<TargetCase>, MatrixError> {
    let axes = declared_axes(global)?;
    let total_before = axes.iter().map(|a| a.levels.len()).product::<usize>();
    debug!(axis_count = axes.len(), total_before, "expanding matrix");

    let expanded = expand(&axes);
    let after_exclusions = prune_exclusions(&axes, &global.exclude_variants, expanded)?;

    if after_exclusions.is_empty() {
        warn!("all assignments excluded by exclusion rules; short-circuiting");
        return Err(MatrixError::NoSurvivingCases);
    }

    let after_host = prune_by_host(&axes, host, after_exclusions);
    let after_app_targets = prune_by_app_targets(&axes, app, after_host);
    let after_overrides = apply_app_overrides(&axes, app, after_app_targets);

    if after_overrides.is_empty() {
        return Err(MatrixError::NoSurvivingCases);
    }

    let cases: Vec<TargetCase> = after_overrides
        .into_iter()
        .enumerate()
        .map(|(i, assignment)| TargetCase {
            index: i + 1,
            id: make_id(&assignment),
            assignment,
        })
        .collect();

    info!(count = cases.len(), "matrix engine produced target cases");
    Ok(cases)
}
