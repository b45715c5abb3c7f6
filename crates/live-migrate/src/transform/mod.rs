//! Record transformers.
//!
//! [`RuleTransformer`] applies the declarative [`TransformRules`] configured
//! per collection. Rules name fields as they appear in the source record and
//! are applied in a fixed order: required-field check, JSON parsing, comma
//! splitting, then renaming.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::{CollectionConfig, TransformRules};
use crate::core::{Collection, Record, RecordTransformer};
use crate::error::{MigrateError, Result};

/// Passes records through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl RecordTransformer for IdentityTransformer {
    fn transform(&self, _collection: &Collection, record: &Record) -> Result<Record> {
        Ok(record.clone())
    }
}

/// Applies per-collection [`TransformRules`]; collections without rules pass through.
#[derive(Debug, Clone, Default)]
pub struct RuleTransformer {
    rules: HashMap<String, TransformRules>,
}

impl RuleTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the non-empty rule sets of the configured collections.
    pub fn from_collections(collections: &[CollectionConfig]) -> Self {
        let rules = collections
            .iter()
            .filter(|c| !c.transform.is_empty())
            .map(|c| (c.name.clone(), c.transform.clone()))
            .collect();
        Self { rules }
    }

    pub fn with_rules(mut self, collection: impl Into<String>, rules: TransformRules) -> Self {
        self.rules.insert(collection.into(), rules);
        self
    }
}

impl RecordTransformer for RuleTransformer {
    fn transform(&self, collection: &Collection, record: &Record) -> Result<Record> {
        let Some(rules) = self.rules.get(&collection.name) else {
            return Ok(record.clone());
        };
        let fail = |message: String| MigrateError::schema(&collection.name, Some(record.key.0), message);
        let mut out = record.clone();

        for name in &rules.required {
            if out.field(name).map_or(true, Value::is_null) {
                return Err(fail(format!("required field '{}' is missing", name)));
            }
        }

        for name in &rules.json_fields {
            if let Some(Value::String(raw)) = out.fields.get(name) {
                let parsed: Value = serde_json::from_str(raw)
                    .map_err(|e| fail(format!("field '{}' is not valid JSON: {}", name, e)))?;
                out.fields.insert(name.clone(), parsed);
            }
        }

        for name in &rules.split_fields {
            if let Some(Value::String(raw)) = out.fields.get(name) {
                let parts: Vec<Value> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Value::from)
                    .collect();
                out.fields.insert(name.clone(), Value::Array(parts));
            }
        }

        for (from, to) in &rules.rename {
            if let Some(value) = out.fields.remove(from) {
                out.fields.insert(to.clone(), value);
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn products_rules() -> TransformRules {
        TransformRules {
            rename: [("nutritionalInfo".to_string(), "nutritional_info".to_string())]
                .into_iter()
                .collect(),
            json_fields: vec!["nutritionalInfo".to_string()],
            split_fields: vec!["claims".to_string()],
            required: vec!["sku".to_string()],
        }
    }

    fn product(key: i64) -> Record {
        let now = Utc::now();
        Record::new(key, now, now)
            .with_field("sku", "SKU-1")
            .with_field("nutritionalInfo", r#"{"kcal": 120}"#)
            .with_field("claims", "organic, vegan ,, gluten-free")
    }

    #[test]
    fn test_identity_keeps_record() {
        let record = product(1);
        let out = IdentityTransformer
            .transform(&Collection::new("products"), &record)
            .unwrap();
        assert_eq!(out, record);
    }

    #[test]
    fn test_rules_reshape_record() {
        let t = RuleTransformer::new().with_rules("products", products_rules());
        let out = t.transform(&Collection::new("products"), &product(5)).unwrap();

        assert_eq!(out.key.0, 5);
        assert_eq!(out.field("nutritional_info"), Some(&json!({"kcal": 120})));
        assert!(out.field("nutritionalInfo").is_none());
        assert_eq!(
            out.field("claims"),
            Some(&json!(["organic", "vegan", "gluten-free"]))
        );
    }

    #[test]
    fn test_invalid_json_is_schema_error() {
        let t = RuleTransformer::new().with_rules("products", products_rules());
        let bad = product(9).with_field("nutritionalInfo", "{not json");
        let err = t.transform(&Collection::new("products"), &bad).unwrap_err();
        assert!(matches!(err, MigrateError::Schema { key: Some(9), .. }));
    }

    #[test]
    fn test_missing_required_field_is_schema_error() {
        let t = RuleTransformer::new().with_rules("products", products_rules());
        let bad = product(3).with_field("sku", Value::Null);
        assert!(t.transform(&Collection::new("products"), &bad).is_err());
    }

    #[test]
    fn test_already_structured_values_pass_through() {
        let t = RuleTransformer::new().with_rules("products", products_rules());
        let record = product(2)
            .with_field("nutritionalInfo", json!({"kcal": 1}))
            .with_field("claims", json!(["a"]));
        let out = t.transform(&Collection::new("products"), &record).unwrap();
        assert_eq!(out.field("claims"), Some(&json!(["a"])));
        assert_eq!(out.field("nutritional_info"), Some(&json!({"kcal": 1})));
    }

    #[test]
    fn test_unconfigured_collection_passes_through() {
        let t = RuleTransformer::new().with_rules("products", products_rules());
        let record = product(1);
        assert_eq!(t.transform(&Collection::new("users"), &record).unwrap(), record);
    }
}
