//! Records produced by the extraction pipeline, validated at the boundary
//! before anything reaches the graph.

use crate::error::{CoreError, Result};
use crate::graph::{is_valid_rel_type, DocId, EntityKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const EXTRACTION_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    EXTRACTION_SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source_document_id: DocId,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ExtractedEntity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.name.trim(), self.entity_type.trim())
    }
}

/// A relationship between two entities of the same extraction, referenced by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub relationship_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source_document_id: DocId,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentExtraction {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub document_id: DocId,
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

fn check_confidence(what: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(CoreError::Validation(format!(
            "{what}: confidence {value} is outside [0, 1]"
        )));
    }
    Ok(())
}

impl DocumentExtraction {
    /// Reject anything that must not be written for `document_id`.
    pub fn validate(&self, document_id: &str) -> Result<()> {
        if self.schema_version != EXTRACTION_SCHEMA_VERSION {
            return Err(CoreError::Validation(format!(
                "unsupported extraction schema version {} (expected {})",
                self.schema_version, EXTRACTION_SCHEMA_VERSION
            )));
        }
        if self.document_id != document_id {
            return Err(CoreError::Validation(format!(
                "extraction is for document '{}', not '{document_id}'",
                self.document_id
            )));
        }

        for (i, e) in self.entities.iter().enumerate() {
            if e.name.trim().is_empty() || e.entity_type.trim().is_empty() {
                return Err(CoreError::Validation(format!(
                    "entity #{i}: name and type must be non-empty"
                )));
            }
            if e.source_document_id != document_id {
                return Err(CoreError::Validation(format!(
                    "entity '{}': source document '{}' does not match '{document_id}'",
                    e.name, e.source_document_id
                )));
            }
            check_confidence(&format!("entity '{}'", e.name), e.confidence)?;
        }

        for r in &self.relationships {
            let label = format!("relationship {} -[{}]-> {}", r.source, r.relationship_type, r.target);
            if !is_valid_rel_type(&r.relationship_type) {
                return Err(CoreError::Validation(format!(
                    "{label}: type must be non-empty letters, digits and underscores"
                )));
            }
            if r.source_document_id != document_id {
                return Err(CoreError::Validation(format!(
                    "{label}: source document '{}' does not match '{document_id}'",
                    r.source_document_id
                )));
            }
            check_confidence(&label, r.confidence)?;
        }
        self.resolve_relationships().map(|_| ())
    }

    /// Map each relationship's endpoint names onto entity keys from this
    /// extraction. A name used with two different types is ambiguous.
    pub fn resolve_relationships(&self) -> Result<Vec<(EntityKey, String, EntityKey)>> {
        let mut by_name: HashMap<&str, Vec<EntityKey>> = HashMap::new();
        for e in &self.entities {
            let key = e.key();
            let slot = by_name.entry(e.name.trim()).or_default();
            if !slot.contains(&key) {
                slot.push(key);
            }
        }
        let lookup = |name: &str| -> Result<EntityKey> {
            match by_name.get(name.trim()).map(Vec::as_slice) {
                Some([key]) => Ok(key.clone()),
                Some([]) | None => Err(CoreError::Validation(format!(
                    "relationship endpoint '{name}' is not an extracted entity"
                ))),
                Some(_) => Err(CoreError::Validation(format!(
                    "relationship endpoint '{name}' matches several entity types"
                ))),
            }
        };
        self.relationships
            .iter()
            .map(|r| {
                Ok((
                    lookup(&r.source)?,
                    r.relationship_type.trim().to_string(),
                    lookup(&r.target)?,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extraction() -> DocumentExtraction {
        serde_json::from_value(json!({
            "document_id": "manual-7",
            "entities": [
                {"name": "Fryer", "type": "equipment", "source_document_id": "manual-7", "confidence": 0.9},
                {"name": "OilChange", "type": "procedure", "source_document_id": "manual-7", "confidence": 0.8}
            ],
            "relationships": [
                {"source": "OilChange", "target": "Fryer", "relationship_type": "APPLIES_TO",
                 "source_document_id": "manual-7", "confidence": 0.7}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn valid_extraction_passes() {
        let ex = extraction();
        assert_eq!(ex.schema_version, EXTRACTION_SCHEMA_VERSION);
        ex.validate("manual-7").unwrap();
        let rels = ex.resolve_relationships().unwrap();
        assert_eq!(rels[0].0, EntityKey::new("OilChange", "procedure"));
        assert_eq!(rels[0].2, EntityKey::new("Fryer", "equipment"));
    }

    #[test]
    fn wrong_document_is_rejected() {
        let err = extraction().validate("manual-8").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn confidence_out_of_range_is_rejected() {
        let mut ex = extraction();
        ex.entities[0].confidence = 1.5;
        assert!(ex.validate("manual-7").is_err());
        ex.entities[0].confidence = f64::NAN;
        assert!(ex.validate("manual-7").is_err());
    }

    #[test]
    fn blank_names_are_rejected() {
        let mut ex = extraction();
        ex.entities[1].entity_type = "  ".into();
        assert!(ex.validate("manual-7").unwrap_err().to_string().contains("non-empty"));
    }

    #[test]
    fn dangling_and_ambiguous_endpoints() {
        let mut ex = extraction();
        ex.relationships[0].target = "Grill".into();
        assert!(ex.validate("manual-7").unwrap_err().to_string().contains("Grill"));

        let mut ex = extraction();
        let mut dup = ex.entities[0].clone();
        dup.entity_type = "brand".into();
        ex.entities.push(dup);
        assert!(ex.validate("manual-7").unwrap_err().to_string().contains("several"));
    }

    #[test]
    fn relationship_type_must_be_an_identifier() {
        let mut ex = extraction();
        ex.relationships[0].relationship_type = "APPLIES TO`".into();
        assert!(ex.validate("manual-7").unwrap_err().to_string().contains("underscores"));
    }

    #[test]
    fn future_schema_is_rejected() {
        let mut ex = extraction();
        ex.schema_version = 2;
        assert!(ex.validate("manual-7").is_err());
    }
}
