use super::{normalize, Encoder, COPY, DECODABLE};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Suffix matching every file that has no rule of its own.
pub const WILDCARD: &str = "*";

/// A rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<String>,
}

impl RuleSpec {
    pub fn new(source: &str, target: Option<&str>, conversion: Option<&str>) -> Self {
        Self {
            source: source.to_string(),
            target: target.map(String::from),
            conversion: conversion.map(String::from),
        }
    }
}

/// A validated rule: source suffix to target suffix with a normalized conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRule {
    pub source: String,
    pub target: String,
    pub conversion: String,
    pub encoder: Encoder,
}

impl ConversionRule {
    /// File name the target counterpart of `file_name` gets under this rule.
    pub fn target_name(&self, file_name: &str) -> String {
        if self.target == WILDCARD {
            return file_name.to_string();
        }
        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.to_string());
        format!("{}.{}", stem, self.target)
    }

    pub fn is_copy(&self) -> bool {
        self.encoder == Encoder::Copy
    }
}

/// Lookup from source suffix to conversion rule.
///
/// Built once from the config; any suffix pair without an executor is
/// rejected here so the scanner never meets a file it cannot handle.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: HashMap<String, ConversionRule>,
    wildcard: Option<ConversionRule>,
}

impl RuleTable {
    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self, ConfigError> {
        let mut table = RuleTable::default();

        for spec in specs {
            let source = clean_suffix(&spec.source);
            let target = spec
                .target
                .as_deref()
                .map(clean_suffix)
                .unwrap_or_else(|| source.clone());

            if source.is_empty() || target.is_empty() {
                return Err(ConfigError::InvalidRule {
                    suffix: spec.source.clone(),
                    message: "empty suffix".to_string(),
                });
            }

            if table.rules.contains_key(&source)
                || (source == WILDCARD && table.wildcard.is_some())
            {
                return Err(ConfigError::DuplicateRule(source));
            }

            let conversion = match spec.conversion.as_deref() {
                Some(raw) => normalize(&target, raw).map_err(|e| ConfigError::Conversion {
                    suffix: source.clone(),
                    source: e,
                })?,
                None if source == target => COPY.to_string(),
                None => {
                    return Err(ConfigError::InvalidRule {
                        suffix: source,
                        message: format!("a conversion is required to produce '{}'", target),
                    })
                }
            };

            if source == WILDCARD || target == WILDCARD {
                if source != target || conversion != COPY {
                    return Err(ConfigError::InvalidRule {
                        suffix: source,
                        message: "the wildcard rule must copy to '*'".to_string(),
                    });
                }
            } else if conversion == COPY && source != target {
                return Err(ConfigError::InvalidRule {
                    suffix: source,
                    message: format!("cannot copy into a different suffix '{}'", target),
                });
            }

            let encoder = Self::executor_for(&source, &target, &conversion).ok_or_else(|| {
                ConfigError::UnsupportedConversion {
                    from: source.clone(),
                    to: target.clone(),
                }
            })?;

            let rule = ConversionRule {
                source: source.clone(),
                target,
                conversion,
                encoder,
            };
            if source == WILDCARD {
                table.wildcard = Some(rule);
            } else {
                table.rules.insert(source, rule);
            }
        }

        Ok(table)
    }

    /// Executor responsible for converting `source` files into `target` files.
    pub fn executor_for(source: &str, target: &str, conversion: &str) -> Option<Encoder> {
        if conversion == COPY {
            return Some(Encoder::Copy);
        }
        if !DECODABLE.contains(&source) {
            return None;
        }
        Encoder::for_suffix(target)
    }

    /// Rule for a file name: exact suffix first, then the wildcard.
    pub fn lookup(&self, file_name: &str) -> Option<&ConversionRule> {
        let suffix = Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        suffix
            .and_then(|s| self.rules.get(&s))
            .or(self.wildcard.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.wildcard.is_none()
    }

    pub fn len(&self) -> usize {
        self.rules.len() + usize::from(self.wildcard.is_some())
    }

    /// Whether any rule needs the external encoder.
    pub fn needs_encoder(&self) -> bool {
        self.rules.values().any(|r| !r.is_copy())
    }
}

fn clean_suffix(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_lowercase()
}
