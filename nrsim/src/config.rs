//! Scenario File Loading
//!
//! Scenarios are TOML by default; YAML and JSON files are accepted too and
//! picked by extension.

use anyhow::{bail, Context, Result};
use layers::simulation::ScenarioConfig;
use std::path::Path;

/// On-disk representation of a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioFormat {
    Toml,
    Yaml,
    Json,
}

impl ScenarioFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") | None => Ok(ScenarioFormat::Toml),
            Some("yaml") | Some("yml") => Ok(ScenarioFormat::Yaml),
            Some("json") => Ok(ScenarioFormat::Json),
            Some(other) => bail!("Unsupported scenario file extension: .{}", other),
        }
    }
}

/// Parse and validate a scenario
pub fn parse_scenario(contents: &str, format: ScenarioFormat) -> Result<ScenarioConfig> {
    let config: ScenarioConfig = match format {
        ScenarioFormat::Toml => toml::from_str(contents).context("Invalid TOML scenario")?,
        ScenarioFormat::Yaml => serde_yaml::from_str(contents).context("Invalid YAML scenario")?,
        ScenarioFormat::Json => serde_json::from_str(contents).context("Invalid JSON scenario")?,
    };
    config.validate().context("Inconsistent scenario")?;
    Ok(config)
}

pub fn load_scenario(path: &Path) -> Result<ScenarioConfig> {
    let format = ScenarioFormat::from_path(path)?;
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario {}", path.display()))?;
    parse_scenario(&contents, format).with_context(|| format!("Failed to load {}", path.display()))
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub seed: Option<u64>,
    pub duration_ms: Option<u64>,
    pub no_trace: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut ScenarioConfig) -> Result<()> {
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(duration_ms) = self.duration_ms {
            config.duration_ms = duration_ms;
        }
        if self.no_trace {
            config.trace = false;
        }
        config.validate().context("Invalid command-line override")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ScenarioFormat::from_path(Path::new("a.toml")).unwrap(), ScenarioFormat::Toml);
        assert_eq!(ScenarioFormat::from_path(Path::new("a.yml")).unwrap(), ScenarioFormat::Yaml);
        assert_eq!(ScenarioFormat::from_path(Path::new("dir/a.json")).unwrap(), ScenarioFormat::Json);
        assert_eq!(ScenarioFormat::from_path(Path::new("scenario")).unwrap(), ScenarioFormat::Toml);
        assert!(ScenarioFormat::from_path(Path::new("a.ini")).is_err());
    }

    #[test]
    fn test_parse_yaml_scenario() {
        let yaml = r#"
seed: 9
phy:
  pattern: "DL|UL|"
gnbs:
  - cell_id: 2
ues:
  - rnti: 5
    serving_cell: 2
default_loss_db: 90.0
"#;
        let config = parse_scenario(yaml, ScenarioFormat::Yaml).unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.phy.pattern, "DL|UL|");
        assert_eq!(config.ues[0].serving_cell, Some(2));
        assert_eq!(config.default_loss_db, 90.0);
    }

    #[test]
    fn test_parse_rejects_inconsistent_scenario() {
        let toml = r#"
            [[ues]]
            rnti = 5
            serving_cell = 3
        "#;
        assert!(parse_scenario(toml, ScenarioFormat::Toml).is_err());
        assert!(parse_scenario("{", ScenarioFormat::Json).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = parse_scenario("seed = 1", ScenarioFormat::Toml).unwrap();
        let overrides = Overrides {
            seed: Some(42),
            duration_ms: Some(7),
            no_trace: true,
        };
        overrides.apply(&mut config).unwrap();
        assert_eq!(config.seed, 42);
        assert_eq!(config.duration_ms, 7);
        assert!(!config.trace);

        let zero = Overrides {
            duration_ms: Some(0),
            ..Overrides::default()
        };
        assert!(zero.apply(&mut config).is_err());
    }
}
