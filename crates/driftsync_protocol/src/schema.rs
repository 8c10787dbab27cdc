//! Record schemas and the type priority order.
//!
//! Payloads are untyped maps inside the engine. A [`TypeOrder`] is the single
//! place where their shape is checked: once when a change is pushed, once when
//! it is pulled. It also defines the order in which types are transmitted,
//! parents before children.

use crate::change::{ChangeKey, WireChange};
use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{RecordId, RecordType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// A payload field holding the id of a parent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Payload field containing the parent id.
    pub field: String,
    /// Type of the parent record.
    pub parent_type: RecordType,
    /// Whether the field may be absent or null.
    #[serde(default)]
    pub optional: bool,
}

/// Shape of one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    /// The type described.
    pub record_type: RecordType,
    /// Fields every live record of this type must carry.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Parent references.
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl RecordSchema {
    /// Creates a schema with no constraints.
    pub fn new(record_type: impl Into<RecordType>) -> Self {
        Self {
            record_type: record_type.into(),
            required_fields: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Adds a required field.
    #[must_use]
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    /// Adds a mandatory parent reference.
    #[must_use]
    pub fn reference(mut self, field: impl Into<String>, parent: impl Into<RecordType>) -> Self {
        self.references.push(Reference {
            field: field.into(),
            parent_type: parent.into(),
            optional: false,
        });
        self
    }

    /// Adds a parent reference that may be absent.
    #[must_use]
    pub fn optional_reference(
        mut self,
        field: impl Into<String>,
        parent: impl Into<RecordType>,
    ) -> Self {
        self.references.push(Reference {
            field: field.into(),
            parent_type: parent.into(),
            optional: true,
        });
        self
    }
}

/// Why a change does not fit its schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    /// No schema exists for the change's type.
    #[error("unknown record type '{0}'")]
    UnknownType(RecordType),
    /// A required field is absent.
    #[error("missing required field '{field}'")]
    MissingField {
        /// The field.
        field: String,
    },
    /// A reference field is absent or not a string id.
    #[error("invalid reference in field '{field}'")]
    InvalidReference {
        /// The field.
        field: String,
    },
}

impl SchemaViolation {
    /// True when the type itself is unknown, as opposed to a malformed payload.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, SchemaViolation::UnknownType(_))
    }
}

/// A validated, total order over record types.
///
/// Every parent reference must name a type at or before the referencing type,
/// so cycles are impossible once construction succeeds. Self references are
/// allowed (a record may point at another record of its own type).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<RecordSchema>", into = "Vec<RecordSchema>")]
pub struct TypeOrder {
    schemas: Vec<RecordSchema>,
    index: HashMap<RecordType, usize>,
}

impl TypeOrder {
    /// Validates and builds an order from schemas listed parents first.
    pub fn new(schemas: Vec<RecordSchema>) -> ProtocolResult<Self> {
        let mut index = HashMap::with_capacity(schemas.len());
        for (position, schema) in schemas.iter().enumerate() {
            if index.insert(schema.record_type.clone(), position).is_some() {
                return Err(ProtocolError::InvalidTypeOrder(format!(
                    "type '{}' listed twice",
                    schema.record_type
                )));
            }
        }

        for (position, schema) in schemas.iter().enumerate() {
            for reference in &schema.references {
                match index.get(&reference.parent_type) {
                    Some(&parent) if parent <= position => {}
                    Some(_) => {
                        return Err(ProtocolError::InvalidTypeOrder(format!(
                            "type '{}' references '{}', which is ordered after it",
                            schema.record_type, reference.parent_type
                        )))
                    }
                    None => {
                        return Err(ProtocolError::InvalidTypeOrder(format!(
                            "type '{}' references unknown type '{}'",
                            schema.record_type, reference.parent_type
                        )))
                    }
                }
            }
        }

        Ok(Self { schemas, index })
    }

    /// Position of `record_type` in the order, if configured.
    pub fn priority(&self, record_type: &RecordType) -> Option<usize> {
        self.index.get(record_type).copied()
    }

    /// Schema of `record_type`, if configured.
    pub fn schema(&self, record_type: &RecordType) -> Option<&RecordSchema> {
        self.priority(record_type).map(|i| &self.schemas[i])
    }

    /// All schemas in priority order.
    pub fn schemas(&self) -> &[RecordSchema] {
        &self.schemas
    }

    /// Returns true if no types are configured.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Whether `child` references `parent`, directly or through other types.
    pub fn depends_on(&self, child: &RecordType, parent: &RecordType) -> bool {
        if child == parent {
            return false;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![child.clone()];
        while let Some(current) = stack.pop() {
            let Some(schema) = self.schema(&current) else {
                continue;
            };
            for reference in &schema.references {
                if &reference.parent_type == parent {
                    return true;
                }
                if seen.insert(reference.parent_type.clone()) {
                    stack.push(reference.parent_type.clone());
                }
            }
        }
        false
    }

    /// Checks a change against its type's schema.
    ///
    /// Tombstones keep whatever payload they had, so required fields are not
    /// enforced on them. References present in the payload are still checked.
    pub fn validate_change(&self, change: &WireChange) -> Result<(), SchemaViolation> {
        let schema = self
            .schema(&change.record_type)
            .ok_or_else(|| SchemaViolation::UnknownType(change.record_type.clone()))?;
        let deleted = change.deleted_at.is_some();

        if !deleted {
            for field in &schema.required_fields {
                if !change.payload.contains_key(field) {
                    return Err(SchemaViolation::MissingField {
                        field: field.clone(),
                    });
                }
            }
        }

        for reference in &schema.references {
            match change.payload.get(&reference.field) {
                Some(serde_json::Value::String(id)) if !id.is_empty() => {}
                None | Some(serde_json::Value::Null) if reference.optional || deleted => {}
                _ => {
                    return Err(SchemaViolation::InvalidReference {
                        field: reference.field.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Parent records referenced by a change's payload.
    pub fn references_of(&self, change: &WireChange) -> Vec<ChangeKey> {
        let Some(schema) = self.schema(&change.record_type) else {
            return Vec::new();
        };
        schema
            .references
            .iter()
            .filter_map(|reference| {
                let id = change.payload.get(&reference.field)?.as_str()?;
                Some(ChangeKey::new(
                    reference.parent_type.clone(),
                    RecordId::new(id),
                ))
            })
            .collect()
    }
}

impl TryFrom<Vec<RecordSchema>> for TypeOrder {
    type Error = ProtocolError;

    fn try_from(schemas: Vec<RecordSchema>) -> Result<Self, Self::Error> {
        Self::new(schemas)
    }
}

impl From<TypeOrder> for Vec<RecordSchema> {
    fn from(order: TypeOrder) -> Self {
        order.schemas
    }
}
