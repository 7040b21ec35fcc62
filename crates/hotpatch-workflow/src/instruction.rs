//! Instruction parsing and target resolution
//!
//! Instructions arrive as `"<target_key>: <free-form instruction>"`. The first
//! colon splits the two; later colons belong to the instruction.

use hotpatch_core::{HotpatchConfig, TargetSpec};
use std::collections::BTreeMap;

/// Why an instruction could not be turned into a proposal request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// No `:` separator
    MissingDelimiter,
    /// Nothing before the separator
    EmptyTarget,
    /// Nothing after the separator
    EmptyInstruction,
    /// Target key not in the table
    UnknownTarget(String),
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDelimiter | Self::EmptyTarget => {
                write!(f, "Use format: `<target>: your instruction here`")
            }
            Self::EmptyInstruction => write!(f, "Instruction is empty. Say what to change after the `:`"),
            Self::UnknownTarget(key) => write!(f, "Unknown target: {}", key),
        }
    }
}

/// A resolved instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInstruction {
    pub target: TargetSpec,
    pub instruction: String,
}

/// Static mapping from short keys to target specs, loaded once at start
#[derive(Debug, Clone, Default)]
pub struct TargetTable {
    targets: BTreeMap<String, TargetSpec>,
}

impl TargetTable {
    pub fn new(targets: impl IntoIterator<Item = TargetSpec>) -> Self {
        Self {
            targets: targets
                .into_iter()
                .map(|t| (t.key.to_lowercase(), t))
                .collect(),
        }
    }

    pub fn from_config(config: &HotpatchConfig) -> Self {
        Self::new(config.target_specs().into_values())
    }

    /// Look up a target by key (case-insensitive)
    pub fn resolve(&self, key: &str) -> Result<&TargetSpec, ParseFailure> {
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return Err(ParseFailure::EmptyTarget);
        }
        self.targets
            .get(&key)
            .ok_or(ParseFailure::UnknownTarget(key))
    }

    /// Parse `"<target_key>: <instruction>"`
    pub fn parse(&self, raw: &str) -> Result<ParsedInstruction, ParseFailure> {
        let (key, instruction) = raw
            .trim()
            .split_once(':')
            .ok_or(ParseFailure::MissingDelimiter)?;

        let target = self.resolve(key)?;
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(ParseFailure::EmptyInstruction);
        }

        Ok(ParsedInstruction {
            target: target.clone(),
            instruction: instruction.to_string(),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetSpec> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
