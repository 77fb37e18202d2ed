use super::types::SyncConfig;
use crate::error::Result;
use std::path::Path;

/// Parse and validate a sheetsync.yaml file
pub fn parse_config(path: &Path) -> Result<SyncConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse and validate a config YAML string
pub fn parse_config_str(content: &str) -> Result<SyncConfig> {
    let config: SyncConfig = serde_yaml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Staleness;
    use crate::error::SyncError;
    use crate::merge::{ConflictStrategy, MergeMode};
    use crate::schema::FieldKind;

    const CONFIG: &str = r#"
settings:
  key_prefix: game
  staleness: wait
  retry:
    max_attempts: 5

tables:
  Config_Unit(hero):
    source: config/units_hero
    range: A1:H
    schema:
      type_hints:
        Level: int
      array_columns: [Tags]
  Config_Unit(soldier):
    source: config/units_soldier
    ttl_secs: 60

groups:
  Config_Unit:
    merge:
      conflict_strategy: merge_fields
      priority_order: [hero, soldier]
    grouping_fields: [Subtype, Tier]
"#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_config_str(CONFIG).unwrap();

        assert_eq!(config.settings.key_prefix, "game");
        assert_eq!(config.settings.staleness, Staleness::Wait);
        assert_eq!(config.settings.retry.max_attempts, 5);
        assert_eq!(config.settings.retry.backoff_ms, 200);
        assert_eq!(config.settings.default_ttl_secs, 1800);

        let hero = config.table("Config_Unit(hero)").unwrap();
        assert_eq!(hero.range.as_ref().unwrap().to_string(), "A1:H");
        assert_eq!(hero.schema.type_hints.get("Level"), Some(&FieldKind::Int));
        assert!(hero.schema.array_columns.contains("Tags"));

        assert_eq!(config.table_ttl("Config_Unit(soldier)"), 60);
        assert_eq!(config.table_ttl("Config_Unit(hero)"), 1800);
        assert_eq!(config.table_grouping_fields("Config_Unit(hero)"), vec!["Subtype".to_string()]);
        assert_eq!(config.key_column("Config_Unit(hero)"), "ID");

        let rule = config.merge_rule("Config_Unit");
        assert_eq!(rule.conflict_strategy, ConflictStrategy::MergeFields);
        assert_eq!(rule.merge_mode, MergeMode::BySubtype);
        assert_eq!(config.group_grouping_fields("Config_Unit").len(), 2);
        assert_eq!(config.merge_rule("Unknown"), Default::default());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config_str("{}").unwrap();
        assert_eq!(config.settings.key_prefix, "sheetsync");
        assert_eq!(config.settings.default_grouping_fields, vec!["Subtype".to_string()]);
        assert_eq!(config.settings.staleness, Staleness::ServeStale);
    }

    #[test]
    fn test_bad_range_rejected() {
        let err = parse_config_str("tables:\n  T:\n    source: t\n    range: Z9:A1\n").unwrap_err();
        assert!(matches!(err, SyncError::Yaml(_)));
    }

    #[test]
    fn test_validation_collects_problems() {
        let yaml = r#"
settings:
  default_ttl_secs: 0
groups:
  G:
    merge:
      priority_order: [a, b, a]
"#;
        let err = parse_config_str(yaml).unwrap_err();
        let SyncError::Config(message) = err else {
            panic!("expected config error, got {err:?}");
        };
        assert!(message.contains("default_ttl_secs"));
        assert!(message.contains("'a' listed twice"));
    }

    #[test]
    fn test_parse_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("sheetsync.yaml");
        std::fs::write(&path, CONFIG).unwrap();
        assert_eq!(parse_config(&path).unwrap().tables.len(), 2);
    }
}
