//! Typed records for the two on-disk configuration documents: the global
//! matrix description and the per-application manifest. Both are plain data
//! (no behavior attached) loaded through the same `load_yaml` helper —
//! there is no class hierarchy to collapse here, just one shared function.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::UkError;

/// Reads and deserializes a YAML document, wrapping any failure in
/// `UkError::ConfigParse` with the offending path attached.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, UkError> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()));
    let raw = raw.map_err(|source| UkError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing YAML in {}", path.display()))
        .map_err(|source| UkError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
}

/// `tools.vmm` / `tools.compiler` entries: either the literal `system`
/// (discover on PATH) or an explicit arch/type/path record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolSpec {
    System(SystemMarker),
    Explicit {
        arch: String,
        #[serde(rename = "type")]
        kind: String,
        path: PathBuf,
    },
}

/// Deserializes only from the literal string `"system"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SystemMarker;

impl TryFrom<String> for SystemMarker {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "system" {
            Ok(SystemMarker)
        } else {
            Err(format!("expected literal \"system\", got \"{value}\""))
        }
    }
}

impl From<SystemMarker> for String {
    fn from(_: SystemMarker) -> Self {
        "system".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub vmm: HashMap<String, ToolSpec>,
    #[serde(default)]
    pub compiler: HashMap<String, ToolSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceConfig {
    pub base: PathBuf,
}

/// One family (`build` or `run`) of axis declarations: axis name -> ordered
/// level list. `IndexMap` preserves declaration order, which is what
/// defines the case index (spec.md §4.2, step 1).
pub type AxisFamily = IndexMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VariantsConfig {
    #[serde(default)]
    pub build: AxisFamily,
    #[serde(default)]
    pub run: AxisFamily,
}

/// One atom of an exclusion rule's conjunction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleAtom {
    /// `axis: level` or `axis: not level`
    Single(String),
    /// `axis: [level, ...]` or `axis: [not, level, ...]` handled by caller
    List(Vec<String>),
}

/// A single exclusion rule: a map of axis name to the atom constraining it.
/// The whole map is a conjunction; the rule fires (and the assignment is
/// dropped) when every atom matches.
pub type ExclusionRuleConfig = IndexMap<String, RuleAtom>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub variants: VariantsConfig,
    #[serde(default)]
    pub exclude_variants: Vec<ExclusionRuleConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

impl GlobalConfig {
    pub fn load(path: &Path) -> Result<Self, UkError> {
        load_yaml(path)
    }
}

/// `(architecture, platform)` pair declared by the application manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppTarget {
    pub architecture: String,
    pub platform: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppType {
    KernelImage,
    ExampleBinary,
}

impl Default for AppType {
    fn default() -> Self {
        AppType::KernelImage
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub rootfs_kind: Option<String>,
    #[serde(default)]
    pub requires_networking: bool,
    #[serde(default)]
    pub forbids_networking: bool,
    #[serde(default)]
    pub requires_filesystem: bool,
    #[serde(default)]
    pub forbids_filesystem: bool,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub success_marker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub targets: Vec<AppTarget>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    #[serde(rename = "type")]
    pub app_type: AppType,
    /// Optional shell script adjacent to the manifest overriding default
    /// build/run commands; recorded as a path and spliced into rendered
    /// scripts verbatim (C4 treats its content as opaque).
    #[serde(default)]
    pub override_script: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, UkError> {
        load_yaml(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_family_preserves_declaration_order() {
        let yaml = "platform: [xen, qemu, fc]\nhypervisor: [none, xen, kvm]\n";
        let family: AxisFamily = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<&String> = family.keys().collect();
        assert_eq!(names, vec!["platform", "hypervisor"]);
    }

    #[test]
    fn system_marker_rejects_other_strings() {
        let result: Result<ToolSpec, _> = serde_yaml::from_str("\"not-system\"");
        assert!(result.is_err());
    }

    #[test]
    fn tool_spec_parses_explicit_record() {
        let yaml = "arch: x86_64\ntype: qemu\npath: /usr/bin/qemu-system-x86_64\n";
        let spec: ToolSpec = serde_yaml::from_str(yaml).unwrap();
        matches!(spec, ToolSpec::Explicit { .. });
    }
}
