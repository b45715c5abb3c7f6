//! Configuration validation.

use std::collections::HashSet;

use super::{CollectionConfig, Config};
use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};

const STORE_SCHEMES: &[&str] = &["postgres", "postgresql", "memory"];
const COORDINATION_SCHEMES: &[&str] = &["redis", "rediss", "memory"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Store validation
    for (side, store) in [("source", &config.source), ("target", &config.target)] {
        if store.url.is_empty() {
            return Err(MigrateError::Config(format!("{}.url is required", side)));
        }
        let scheme = store.scheme();
        if !STORE_SCHEMES.contains(&scheme.as_str()) {
            return Err(MigrateError::Config(format!(
                "{}.url has unsupported scheme '{}'. Supported: {}",
                side,
                scheme,
                STORE_SCHEMES.join(", ")
            )));
        }
        if store.max_connections == 0 {
            return Err(MigrateError::Config(format!(
                "{}.max_connections must be at least 1",
                side
            )));
        }
        validate_identifier(&store.schema)
            .map_err(|e| MigrateError::Config(format!("{}.schema: {}", side, e)))?;
    }

    // Cannot migrate to the same store
    if config.source.url == config.target.url && config.source.scheme() != "memory" {
        return Err(MigrateError::Config(
            "source and target cannot be the same store".into(),
        ));
    }

    let scheme = config.coordination.scheme();
    if !COORDINATION_SCHEMES.contains(&scheme.as_str()) {
        return Err(MigrateError::Config(format!(
            "coordination.url has unsupported scheme '{}'. Supported: {}",
            scheme,
            COORDINATION_SCHEMES.join(", ")
        )));
    }

    // Migration config validation
    let m = &config.migration;
    if m.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if m.parallel_workers == 0 {
        return Err(MigrateError::Config(
            "migration.parallel_workers must be at least 1".into(),
        ));
    }
    if m.sync_interval_ms == 0 {
        return Err(MigrateError::Config(
            "migration.sync_interval_ms must be at least 1".into(),
        ));
    }
    if !(m.validation_sample_fraction > 0.0 && m.validation_sample_fraction <= 1.0) {
        return Err(MigrateError::Config(format!(
            "migration.validation_sample_fraction must be in (0, 1], got {}",
            m.validation_sample_fraction
        )));
    }
    if m.retry_multiplier < 1.0 {
        return Err(MigrateError::Config(format!(
            "migration.retry_multiplier must be >= 1.0, got {}",
            m.retry_multiplier
        )));
    }
    if m.read_only_timeout_ms == 0 {
        return Err(MigrateError::Config(
            "migration.read_only_timeout_ms must be at least 1".into(),
        ));
    }

    // Collection validation
    if config.collections.is_empty() {
        return Err(MigrateError::Config(
            "at least one collection must be configured".into(),
        ));
    }
    let mut names = HashSet::new();
    for collection in &config.collections {
        for column in [
            &collection.name,
            &collection.key_column,
            &collection.created_at_column,
            &collection.updated_at_column,
        ] {
            validate_identifier(column).map_err(|e| {
                MigrateError::Config(format!("collection '{}': {}", collection.name, e))
            })?;
        }
        if !names.insert(collection.name.as_str()) {
            return Err(MigrateError::Config(format!(
                "collection '{}' is declared more than once",
                collection.name
            )));
        }
        validate_critical_fields(collection)?;
    }

    // Dependency graph must resolve (cycle => error unless overridden)
    config.migration_order()?;

    Ok(())
}

/// Critical fields are compared raw, so a transform must leave them untouched.
fn validate_critical_fields(collection: &CollectionConfig) -> Result<()> {
    let rules = &collection.transform;
    for field in &collection.critical_fields {
        let reshaped_by = if rules.rename.contains_key(field) {
            Some("rename")
        } else if rules.json_fields.contains(field) {
            Some("json_fields")
        } else if rules.split_fields.contains(field) {
            Some("split_fields")
        } else {
            None
        };
        if let Some(rule) = reshaped_by {
            return Err(MigrateError::Config(format!(
                "collection '{}': critical field '{}' is changed by transform.{} and cannot be compared during validation",
                collection.name, field, rule
            )));
        }
    }
    Ok(())
}
