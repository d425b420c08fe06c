//! Tests for config module

#[cfg(test)]
mod tests {
    use crate::config::*;
    use std::io::Write;
    use std::time::Duration;

    // ========================================================================
    // Defaults
    // ========================================================================

    #[test]
    fn test_config_default_values() {
        // Arrange & Act
        let config = SieveConfig::default();

        // Assert
        assert!(config.cache.enabled);
        assert_eq!(config.cache.anteroom_record_count, 100_000);
        assert_eq!(config.cache.cache_size_in_bytes, 104_857_600);
        assert_eq!(config.cache.minimal_usage_threshold, 2);
        assert_eq!(config.cache.cooldown_cycles, 1);
        assert_eq!(config.cache.max_record_size_in_bytes, 1_048_576);
    }

    #[test]
    fn test_cache_config_durations() {
        let config = CacheConfig {
            reevaluation_interval_ms: 250,
            adept_ttl_ms: 5_000,
            ..CacheConfig::default()
        };

        assert_eq!(config.reevaluation_interval(), Duration::from_millis(250));
        assert_eq!(config.adept_ttl(), Duration::from_secs(5));
    }

    // ========================================================================
    // TOML parsing
    // ========================================================================

    #[test]
    fn test_config_from_toml_minimal() {
        // Arrange
        let toml_str = r"
[cache]
anteroom_record_count = 16
";

        // Act
        let config = SieveConfig::from_toml(toml_str).expect("parse");

        // Assert
        assert_eq!(config.cache.anteroom_record_count, 16);
        assert_eq!(
            config.cache.cache_size_in_bytes,
            CacheConfig::default().cache_size_in_bytes
        );
    }

    #[test]
    fn test_config_from_toml_full() {
        // Arrange
        let toml_str = r"
[cache]
enabled = false
anteroom_record_count = 64
cache_size_in_bytes = 4096
reevaluation_interval_ms = 100
minimal_complexity_threshold = 5
minimal_usage_threshold = 3
promotion_score_threshold = 2.5
cooldown_score_threshold = 0.25
cooldown_cycles = 3
adept_ttl_ms = 1000
max_record_size_in_bytes = 1024
";

        // Act
        let config = SieveConfig::from_toml(toml_str).expect("parse");

        // Assert
        let cache = &config.cache;
        assert!(!cache.enabled);
        assert_eq!(cache.anteroom_record_count, 64);
        assert_eq!(cache.cache_size_in_bytes, 4096);
        assert_eq!(cache.reevaluation_interval_ms, 100);
        assert_eq!(cache.minimal_complexity_threshold, 5);
        assert_eq!(cache.minimal_usage_threshold, 3);
        assert!((cache.promotion_score_threshold - 2.5).abs() < f64::EPSILON);
        assert!((cache.cooldown_score_threshold - 0.25).abs() < f64::EPSILON);
        assert_eq!(cache.cooldown_cycles, 3);
        assert_eq!(cache.adept_ttl_ms, 1000);
        assert_eq!(cache.max_record_size_in_bytes, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml_wrong_type() {
        let toml_str = r#"
[cache]
anteroom_record_count = "many"
"#;

        let result = SieveConfig::from_toml(toml_str);

        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_load_from_path_reads_file() {
        // Arrange
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[cache]\ncooldown_cycles = 4").expect("write");

        // Act
        let config = SieveConfig::load_from_path(file.path()).expect("load");

        // Assert
        assert_eq!(config.cache.cooldown_cycles, 4);
    }

    #[test]
    fn test_config_load_from_missing_path_uses_defaults() {
        // The jail serializes environment access with the env override test.
        figment::Jail::expect_with(|_jail| {
            let config = SieveConfig::load_from_path("absent.toml").map_err(|e| e.to_string())?;

            assert_eq!(config.cache, CacheConfig::default());
            Ok(())
        });
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_config_validate_success() {
        assert!(SieveConfig::default().validate().is_ok());
    }

    fn assert_invalid_key(config: &CacheConfig, expected_key: &str) {
        match config.validate() {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, expected_key),
            other => panic!("expected invalid {expected_key}, got {other:?}"),
        }
    }

    #[test]
    fn test_config_validate_zero_anteroom() {
        let config = CacheConfig {
            anteroom_record_count: 0,
            ..CacheConfig::default()
        };

        assert_invalid_key(&config, "cache.anteroom_record_count");
    }

    #[test]
    fn test_config_validate_zero_budget() {
        let config = CacheConfig {
            cache_size_in_bytes: 0,
            ..CacheConfig::default()
        };

        assert_invalid_key(&config, "cache.cache_size_in_bytes");
    }

    #[test]
    fn test_config_validate_interval_too_short() {
        let config = CacheConfig {
            reevaluation_interval_ms: 5,
            ..CacheConfig::default()
        };

        assert_invalid_key(&config, "cache.reevaluation_interval_ms");
    }

    #[test]
    fn test_config_validate_negative_threshold() {
        let config = CacheConfig {
            promotion_score_threshold: -1.0,
            ..CacheConfig::default()
        };

        assert_invalid_key(&config, "cache.promotion_score_threshold");
    }

    #[test]
    fn test_config_validate_nan_threshold() {
        let config = CacheConfig {
            cooldown_score_threshold: f64::NAN,
            ..CacheConfig::default()
        };

        assert_invalid_key(&config, "cache.cooldown_score_threshold");
    }

    #[test]
    fn test_config_validate_cooldown_above_promotion() {
        let config = CacheConfig {
            promotion_score_threshold: 1.0,
            cooldown_score_threshold: 2.0,
            ..CacheConfig::default()
        };

        assert_invalid_key(&config, "cache.cooldown_score_threshold");
    }

    #[test]
    fn test_config_validate_record_larger_than_budget() {
        let config = CacheConfig {
            cache_size_in_bytes: 1024,
            max_record_size_in_bytes: 2048,
            ..CacheConfig::default()
        };

        assert_invalid_key(&config, "cache.max_record_size_in_bytes");
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    #[test]
    fn test_config_roundtrip() {
        // Arrange
        let mut config = SieveConfig::default();
        config.cache.anteroom_record_count = 12;
        config.cache.promotion_score_threshold = 3.0;

        // Act
        let toml_str = config.to_toml().expect("serialize");
        let parsed = SieveConfig::from_toml(&toml_str).expect("parse");

        // Assert
        assert!(toml_str.contains("[cache]"));
        assert_eq!(parsed, config);
    }

    // ========================================================================
    // Environment
    // ========================================================================

    #[test]
    fn test_config_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            // Arrange
            jail.create_file(
                "sievedb.toml",
                "[cache]\nanteroom_record_count = 10\ncooldown_cycles = 4",
            )?;
            jail.set_env("SIEVEDB_CACHE__ANTEROOM_RECORD_COUNT", "42");
            jail.set_env("SIEVEDB_CACHE__ENABLED", "false");

            // Act
            let config = SieveConfig::load().map_err(|e| e.to_string())?;

            // Assert
            assert_eq!(config.cache.anteroom_record_count, 42);
            assert_eq!(config.cache.cooldown_cycles, 4);
            assert!(!config.cache.enabled);
            Ok(())
        });
    }
}
