//! Capability catalog
//!
//! Static per-op configuration: default mode, the switch op whose stored
//! mode governs it, whether reading its state is restricted, whether a bulk
//! reset may clear it, which bypass classes may ignore its restrictions and
//! which process capability it needs while merely in the foreground.
//!
//! The catalog is built programmatically or loaded from TOML:
//!
//! ```toml
//! [[op]]
//! name = "CAMERA"
//! code = 26
//! default_mode = "allowed"
//! bypass = ["system_uid"]
//! foreground_capability = ["camera"]
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::errors::{AppOpsError, Result};
use crate::flags::{BypassFlags, ProcessCapabilities};
use crate::ids::OpCode;
use crate::mode::Mode;

/// Static description of one op
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpInfo {
    /// Code of the op
    pub code: OpCode,
    /// Symbolic name
    pub name: String,
    /// Op whose stored mode governs this op
    pub switch: OpCode,
    /// Mode when nothing is stored
    pub default_mode: Mode,
    /// Reading this op's state requires `MANAGE_MODES`
    pub restrict_read: bool,
    /// A bulk reset may clear overrides of this op
    pub allow_reset: bool,
    /// Bypass classes allowed to ignore restrictions of this op
    pub bypass: BypassFlags,
    /// Capability needed in the plain foreground states
    pub foreground_capability: ProcessCapabilities,
}

impl OpInfo {
    /// Create an op that is its own switch and resettable
    pub fn new(code: OpCode, name: impl Into<String>, default_mode: Mode) -> Self {
        Self {
            code,
            name: name.into(),
            switch: code,
            default_mode,
            restrict_read: false,
            allow_reset: true,
            bypass: BypassFlags::empty(),
            foreground_capability: ProcessCapabilities::empty(),
        }
    }

    /// Govern this op by another op's mode
    pub fn with_switch(mut self, switch: OpCode) -> Self {
        self.switch = switch;
        self
    }

    /// Mark reads of this op as restricted
    pub fn with_restricted_read(mut self) -> Self {
        self.restrict_read = true;
        self
    }

    /// Exclude this op from bulk resets
    pub fn without_reset(mut self) -> Self {
        self.allow_reset = false;
        self
    }

    /// Declare bypass eligibility for restrictions
    pub fn with_bypass(mut self, bypass: BypassFlags) -> Self {
        self.bypass = bypass;
        self
    }

    /// Require a while-in-use capability in the plain foreground states
    pub fn with_foreground_capability(mut self, capability: ProcessCapabilities) -> Self {
        self.foreground_capability = capability;
        self
    }
}

/// Validated, immutable op table
#[derive(Debug, Clone)]
pub struct OpCatalog {
    ops: Vec<Option<OpInfo>>,
    by_name: HashMap<String, OpCode>,
    switch_members: HashMap<OpCode, Vec<OpCode>>,
}

impl OpCatalog {
    /// Start building a catalog
    pub fn builder() -> OpCatalogBuilder {
        OpCatalogBuilder::default()
    }

    /// Parse a catalog from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(text)?;
        file.into_catalog()
    }

    /// Load a catalog from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppOpsError::config(format!("failed to read catalog {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Look up an op
    pub fn get(&self, op: OpCode) -> Option<&OpInfo> {
        self.ops.get(op.index()).and_then(Option::as_ref)
    }

    /// Whether the op exists
    pub fn contains(&self, op: OpCode) -> bool {
        self.get(op).is_some()
    }

    /// Look up an op by symbolic name
    pub fn by_name(&self, name: &str) -> Option<&OpInfo> {
        self.by_name.get(name).and_then(|code| self.get(*code))
    }

    /// Switch op of `op`
    pub fn switch_of(&self, op: OpCode) -> Option<OpCode> {
        self.get(op).map(|info| info.switch)
    }

    /// Default mode of `op`
    pub fn default_mode(&self, op: OpCode) -> Option<Mode> {
        self.get(op).map(|info| info.default_mode)
    }

    /// Ops governed by `switch`, including the switch itself
    pub fn ops_sharing_switch(&self, switch: OpCode) -> &[OpCode] {
        self.switch_members
            .get(&switch)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterate over all ops in code order
    pub fn iter(&self) -> impl Iterator<Item = &OpInfo> {
        self.ops.iter().flatten()
    }

    /// Number of ops
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Builder validating an op table
#[derive(Debug, Default)]
pub struct OpCatalogBuilder {
    ops: Vec<OpInfo>,
}

impl OpCatalogBuilder {
    /// Add an op
    pub fn op(mut self, info: OpInfo) -> Self {
        self.ops.push(info);
        self
    }

    /// Validate and freeze the table
    pub fn build(self) -> Result<OpCatalog> {
        let max_index = self.ops.iter().map(|info| info.code.index()).max();
        let mut ops: Vec<Option<OpInfo>> = vec![None; max_index.map_or(0, |max| max + 1)];
        let mut by_name = HashMap::new();

        for info in self.ops {
            if by_name.insert(info.name.clone(), info.code).is_some() {
                return Err(AppOpsError::config(format!(
                    "duplicate op name {}",
                    info.name
                )));
            }
            let slot = &mut ops[info.code.index()];
            if slot.is_some() {
                return Err(AppOpsError::config(format!(
                    "duplicate op code {}",
                    info.code.0
                )));
            }
            *slot = Some(info);
        }

        let mut switch_members: HashMap<OpCode, Vec<OpCode>> = HashMap::new();
        for info in ops.iter().flatten() {
            let Some(switch) = ops.get(info.switch.index()).and_then(Option::as_ref) else {
                return Err(AppOpsError::config(format!(
                    "op {} names unknown switch {}",
                    info.name, info.switch.0
                )));
            };
            if switch.switch != switch.code {
                return Err(AppOpsError::config(format!(
                    "switch {} of op {} is itself switched by {}",
                    switch.name, info.name, switch.switch.0
                )));
            }
            switch_members.entry(info.switch).or_default().push(info.code);
        }

        Ok(OpCatalog {
            ops,
            by_name,
            switch_members,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(rename = "op", default)]
    ops: Vec<OpEntry>,
}

#[derive(Debug, Deserialize)]
struct OpEntry {
    name: String,
    code: u16,
    default_mode: Mode,
    #[serde(default)]
    switch: Option<String>,
    #[serde(default)]
    restrict_read: bool,
    #[serde(default = "default_true")]
    allow_reset: bool,
    #[serde(default)]
    bypass: Vec<String>,
    #[serde(default)]
    foreground_capability: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl CatalogFile {
    fn into_catalog(self) -> Result<OpCatalog> {
        let codes: HashMap<&str, u16> = self
            .ops
            .iter()
            .map(|entry| (entry.name.as_str(), entry.code))
            .collect();

        let mut builder = OpCatalog::builder();
        for entry in &self.ops {
            let code = OpCode(entry.code);
            let switch = match &entry.switch {
                Some(name) => OpCode(*codes.get(name.as_str()).ok_or_else(|| {
                    AppOpsError::config(format!("op {} names unknown switch {name}", entry.name))
                })?),
                None => code,
            };

            let mut info = OpInfo::new(code, entry.name.clone(), entry.default_mode)
                .with_switch(switch)
                .with_bypass(parse_bypass(&entry.bypass)?)
                .with_foreground_capability(parse_capabilities(&entry.foreground_capability)?);
            info.restrict_read = entry.restrict_read;
            info.allow_reset = entry.allow_reset;
            builder = builder.op(info);
        }
        builder.build()
    }
}

fn parse_bypass(names: &[String]) -> Result<BypassFlags> {
    names.iter().try_fold(BypassFlags::empty(), |acc, name| {
        let flag = match name.as_str() {
            "system_uid" => BypassFlags::SYSTEM_UID,
            "privileged" => BypassFlags::PRIVILEGED,
            "exempt" => BypassFlags::EXEMPT,
            other => return Err(AppOpsError::config(format!("unknown bypass class {other}"))),
        };
        Ok(acc | flag)
    })
}

fn parse_capabilities(names: &[String]) -> Result<ProcessCapabilities> {
    names.iter().try_fold(ProcessCapabilities::empty(), |acc, name| {
        let flag = match name.as_str() {
            "location" => ProcessCapabilities::LOCATION,
            "camera" => ProcessCapabilities::CAMERA,
            "microphone" => ProcessCapabilities::MICROPHONE,
            other => return Err(AppOpsError::config(format!("unknown capability {other}"))),
        };
        Ok(acc | flag)
    })
}
