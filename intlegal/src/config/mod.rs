//! Platform configuration
//!
//! A platform names the integer widths its ALU accepts and the widths a
//! single load or store may move. Tables come from a TOML file or from one
//! of the built-in presets:
//!
//! ```toml
//! name = "int8-restricted"
//! alu_widths = [16, 32, 64]
//! memory_widths = [8, 16, 32, 64]
//! vector_lanes = "widen"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};

/// How vectors whose lanes are illegal get a legal representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaneStrategy {
    /// Promote every lane: `<4 x i8>` becomes `<4 x i16>`.
    #[default]
    Widen,
    /// Pack all lanes into one legal integer: `<4 x i8>` becomes `i32`.
    Pack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub name: String,
    pub alu_widths: Vec<u32>,
    pub memory_widths: Vec<u32>,
    #[serde(default)]
    pub vector_lanes: LaneStrategy,
}

const PRESETS: [&str; 3] = ["int8-restricted", "byte-alu", "packed-lanes"];

impl PlatformConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PlatformConfig =
            toml::from_str(text).map_err(|e| CompileError::config(format!("invalid platform table: {e}")))?;
        config.normalized()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CompileError::io_error(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| CompileError::config(e.to_string()))
    }

    /// Built-in platform tables.
    pub fn preset(name: &str) -> Option<Self> {
        let standard = |name: &str, alu: &[u32], lanes| PlatformConfig {
            name: name.to_string(),
            alu_widths: alu.to_vec(),
            memory_widths: vec![8, 16, 32, 64],
            vector_lanes: lanes,
        };
        match name {
            "int8-restricted" => Some(standard(name, &[16, 32, 64], LaneStrategy::Widen)),
            "byte-alu" => Some(standard(name, &[8, 16, 32, 64], LaneStrategy::Widen)),
            "packed-lanes" => Some(standard(name, &[16, 32, 64], LaneStrategy::Pack)),
            _ => None,
        }
    }

    pub fn preset_names() -> &'static [&'static str] {
        &PRESETS
    }

    /// Check the table and return it with sorted, deduplicated widths.
    pub fn normalized(mut self) -> Result<Self> {
        check_widths("alu_widths", &self.alu_widths)?;
        check_widths("memory_widths", &self.memory_widths)?;
        if !self.memory_widths.contains(&8) {
            return Err(CompileError::config(
                "memory_widths must include 8 so every byte-sized width can be decomposed",
            ));
        }
        for widths in [&mut self.alu_widths, &mut self.memory_widths] {
            widths.sort_unstable();
            widths.dedup();
        }
        Ok(self)
    }

    pub fn max_alu_width(&self) -> u32 {
        self.alu_widths.iter().copied().max().unwrap_or(0)
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            name: "int8-restricted".to_string(),
            alu_widths: vec![16, 32, 64],
            memory_widths: vec![8, 16, 32, 64],
            vector_lanes: LaneStrategy::Widen,
        }
    }
}

fn check_widths(field: &str, widths: &[u32]) -> Result<()> {
    if widths.is_empty() {
        return Err(CompileError::config(format!("{field} is empty")));
    }
    for &w in widths {
        if w == 0 || w % 8 != 0 || w > 128 {
            return Err(CompileError::config(format!(
                "{field}: {w} is not a byte multiple between 8 and 128"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for name in PlatformConfig::preset_names() {
            let config = PlatformConfig::preset(name).unwrap();
            assert_eq!(&config.name, name);
            assert!(config.clone().normalized().is_ok());
        }
        assert!(PlatformConfig::preset("nonexistent").is_none());
    }

    #[test]
    fn test_from_toml_normalizes() {
        let config = PlatformConfig::from_toml_str(
            "name = \"odd\"\nalu_widths = [64, 16, 32, 16]\nmemory_widths = [32, 8]\nvector_lanes = \"pack\"\n",
        )
        .unwrap();
        assert_eq!(config.alu_widths, vec![16, 32, 64]);
        assert_eq!(config.memory_widths, vec![8, 32]);
        assert_eq!(config.vector_lanes, LaneStrategy::Pack);
        assert_eq!(config.max_alu_width(), 64);
    }

    #[test]
    fn test_lane_strategy_defaults_to_widen() {
        let config =
            PlatformConfig::from_toml_str("name = \"w\"\nalu_widths = [32]\nmemory_widths = [8, 32]\n").unwrap();
        assert_eq!(config.vector_lanes, LaneStrategy::Widen);
    }

    #[test]
    fn test_rejects_bad_tables() {
        let cases = [
            ("name = \"a\"\nalu_widths = []\nmemory_widths = [8]\n", "alu_widths is empty"),
            ("name = \"a\"\nalu_widths = [12]\nmemory_widths = [8]\n", "12 is not a byte multiple"),
            ("name = \"a\"\nalu_widths = [32]\nmemory_widths = [16, 32]\n", "must include 8"),
            ("name = \"a\"\nalu_widths = \"wide\"\n", "invalid platform table"),
        ];
        for (text, want) in cases {
            let err = PlatformConfig::from_toml_str(text).unwrap_err();
            assert!(matches!(err, CompileError::Config { .. }));
            assert!(err.to_string().contains(want), "{err}");
        }
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PlatformConfig::preset("packed-lanes").unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(PlatformConfig::from_toml_str(&text).unwrap(), config);
    }
}
