//! Bulk data payload decoding.
//!
//! Payloads are nested arrays-of-arrays with no field names. A
//! [`PayloadLayout`] says which arrays carry record lists and where each
//! field sits inside a record, so a host version change is a new layout file
//! rather than a code change.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use hostlens_common::HostlensError;

use crate::key::ThreadMetadataKey;

/// Layout versions this decoder understands.
pub const SUPPORTED_LAYOUT_VERSION: u32 = 1;

/// Anti-hijacking prefix some hosts put in front of JSON responses.
const XSSI_PREFIX: &str = ")]}'";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error(
        "Unsupported payload layout version {found} (supported: {supported})",
        supported = SUPPORTED_LAYOUT_VERSION
    )]
    UnsupportedVersion { found: u32 },
}

/// Index path from a record array to one field.
pub type IndexPath = Vec<usize>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOffsets {
    pub external_id: IndexPath,
    pub subject: IndexPath,
    pub time_string: IndexPath,
    pub people: IndexPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadLayout {
    pub version: u32,
    /// First element of every array that carries a record list.
    pub section_tag: String,
    /// Position of the record list inside a tagged section.
    pub records_index: usize,
    pub fields: FieldOffsets,
}

impl PayloadLayout {
    pub fn from_json(text: &str) -> Result<Self, HostlensError> {
        let layout: Self = serde_json::from_str(text)
            .map_err(|e| HostlensError::Layout(format!("invalid layout: {e}")))?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn load(path: &Path) -> Result<Self, HostlensError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HostlensError::Layout(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), HostlensError> {
        if self.version != SUPPORTED_LAYOUT_VERSION {
            return Err(HostlensError::Layout(format!(
                "layout version {} is not supported",
                self.version
            )));
        }
        if self.section_tag.is_empty() {
            return Err(HostlensError::Layout("section_tag must not be empty".into()));
        }
        for (name, path) in [
            ("external_id", &self.fields.external_id),
            ("subject", &self.fields.subject),
            ("time_string", &self.fields.time_string),
            ("people", &self.fields.people),
        ] {
            if path.is_empty() {
                return Err(HostlensError::Layout(format!(
                    "field offset for {name} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// One record pulled out of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedRecord {
    pub external_id: String,
    pub subject: String,
    pub time_string: String,
    pub people: String,
}

impl DecodedRecord {
    pub fn key(&self) -> ThreadMetadataKey {
        ThreadMetadataKey::new(&self.subject, &self.time_string, &self.people)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Decoded {
    pub records: Vec<DecodedRecord>,
    /// Records present in a tagged section but missing a required field.
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Split raw payload text into its JSON values.
///
/// Accepts a single JSON document or a run of length-prefixed chunks. Bare
/// integers between chunks are the length prefixes and are dropped. A
/// truncated tail after at least one good chunk is logged and ignored.
pub fn split_frames(text: &str) -> Result<Vec<Value>, IngestError> {
    let trimmed = text.trim_start();
    let body = trimmed.strip_prefix(XSSI_PREFIX).unwrap_or(trimmed);

    let mut frames = Vec::new();
    for item in serde_json::Deserializer::from_str(body).into_iter::<Value>() {
        match item {
            Ok(Value::Number(_)) => continue,
            Ok(value) => frames.push(value),
            Err(e) if frames.is_empty() => return Err(IngestError::Malformed(e.to_string())),
            Err(e) => {
                warn!(error = %e, decoded = frames.len(), "Payload has a truncated tail");
                break;
            }
        }
    }

    if frames.is_empty() {
        return Err(IngestError::Malformed("no JSON content after framing".into()));
    }
    Ok(frames)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub fn decode(text: &str, layout: &PayloadLayout) -> Result<Decoded, IngestError> {
    if layout.version != SUPPORTED_LAYOUT_VERSION {
        return Err(IngestError::UnsupportedVersion {
            found: layout.version,
        });
    }

    let mut decoded = Decoded::default();
    for frame in split_frames(text)? {
        collect_sections(&frame, layout, &mut decoded);
    }
    Ok(decoded)
}

fn collect_sections(value: &Value, layout: &PayloadLayout, out: &mut Decoded) {
    let Value::Array(items) = value else {
        if let Value::Object(map) = value {
            for child in map.values() {
                collect_sections(child, layout, out);
            }
        }
        return;
    };

    let tagged = items
        .first()
        .and_then(Value::as_str)
        .is_some_and(|tag| tag == layout.section_tag);

    if tagged {
        if let Some(Value::Array(records)) = items.get(layout.records_index) {
            for record in records {
                match decode_record(record, layout) {
                    Some(r) => out.records.push(r),
                    None => out.skipped += 1,
                }
            }
        }
        return;
    }

    for child in items {
        collect_sections(child, layout, out);
    }
}

fn decode_record(record: &Value, layout: &PayloadLayout) -> Option<DecodedRecord> {
    let fields = &layout.fields;
    Some(DecodedRecord {
        external_id: scalar_text(at_path(record, &fields.external_id)?)?,
        subject: scalar_text(at_path(record, &fields.subject)?)?,
        time_string: scalar_text(at_path(record, &fields.time_string)?)?,
        people: people_text(at_path(record, &fields.people)?)?,
    })
}

fn at_path<'a>(value: &'a Value, path: &[usize]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, &i| v.get(i))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// People come either as one display string or as a list of names, possibly
/// nested one level as `[name, address]` pairs.
fn people_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let names: Vec<&str> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.as_str()),
                    Value::Array(pair) => pair.first().and_then(Value::as_str),
                    _ => None,
                })
                .collect();
            Some(names.join(", "))
        }
        Value::Null => Some(String::new()),
        _ => None,
    }
}
