//! Validated payload shapes produced at the fetch boundary.
//!
//! Resource schemas (campaigns, leads, replies, ...) belong to the consumers.
//! This layer only cares that a response is one of a few known shapes, so
//! nothing past the query coordinator ever sees an unchecked JSON value.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Re-serialize a value through JSON to convert between compatible types.
/// Used to read typed views (job status, job id) out of a `Document`.
pub fn reserialize<T: DeserializeOwned>(value: impl Serialize) -> serde_json::Result<T> {
  serde_json::from_value(serde_json::to_value(value)?)
}

// ============================================================================
// Payload
// ============================================================================

/// A single identified resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
  pub id: String,
  pub attributes: Map<String, Value>,
}

impl Record {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      attributes: Map::new(),
    }
  }

  pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
    self.attributes.insert(field.to_string(), value.into());
    self
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.attributes.get(field)
  }

  fn from_object(mut obj: Map<String, Value>) -> Option<Self> {
    let id = match obj.remove("id")? {
      Value::String(s) => s,
      Value::Number(n) => n.to_string(),
      _ => return None,
    };
    Some(Self {
      id,
      attributes: obj,
    })
  }
}

/// A validated response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
  /// A collection of records, from a bare array or a `{"data": [...]}` envelope.
  List(Vec<Record>),
  /// One object carrying an `id`.
  Record(Record),
  /// Any other object (stats, job status, settings).
  Document(Map<String, Value>),
}

impl Payload {
  /// Validate a raw JSON body into a known shape.
  pub fn from_json(value: Value) -> Result<Self, SyncError> {
    match value {
      Value::Array(items) => Self::records(items).map(Payload::List),
      Value::Object(mut obj) => {
        if obj.contains_key("id") {
          return Record::from_object(obj)
            .map(Payload::Record)
            .ok_or_else(|| SyncError::Decode("record id must be a string or integer".into()));
        }
        match obj.remove("data") {
          Some(Value::Array(items)) => Self::records(items).map(Payload::List),
          Some(other) => {
            obj.insert("data".to_string(), other);
            Ok(Payload::Document(obj))
          }
          None => Ok(Payload::Document(obj)),
        }
      }
      other => Err(SyncError::Decode(format!(
        "expected an object or array, got {}",
        type_name(&other)
      ))),
    }
  }

  fn records(items: Vec<Value>) -> Result<Vec<Record>, SyncError> {
    items
      .into_iter()
      .enumerate()
      .map(|(i, item)| match item {
        Value::Object(obj) => Record::from_object(obj)
          .ok_or_else(|| SyncError::Decode(format!("list item {} has no usable id", i))),
        other => Err(SyncError::Decode(format!(
          "list item {} is {}, expected an object",
          i,
          type_name(&other)
        ))),
      })
      .collect()
  }

  pub fn as_list(&self) -> Option<&[Record]> {
    match self {
      Payload::List(records) => Some(records),
      _ => None,
    }
  }

  pub fn as_record(&self) -> Option<&Record> {
    match self {
      Payload::Record(record) => Some(record),
      _ => None,
    }
  }

  pub fn as_document(&self) -> Option<&Map<String, Value>> {
    match self {
      Payload::Document(doc) => Some(doc),
      _ => None,
    }
  }

  /// Read a typed view out of a document payload.
  pub fn parse_document<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
    match self {
      Payload::Document(doc) => Ok(reserialize(doc)?),
      Payload::Record(record) => {
        let mut obj = record.attributes.clone();
        obj.insert("id".to_string(), Value::String(record.id.clone()));
        Ok(reserialize(obj)?)
      }
      Payload::List(_) => Err(SyncError::Decode("expected a document, got a list".into())),
    }
  }
}

fn type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

// ============================================================================
// Job protocol bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiJobTriggerResponse {
  #[serde(rename = "jobId", alias = "job_id", alias = "id")]
  pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiJobStatusResponse {
  pub status: String,
}
