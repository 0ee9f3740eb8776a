use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// --- Node identity ---

/// Reference identity of a node in the host's presentation layer.
///
/// Collaborators mint one `NodeId` per live node object and never reuse it
/// for a different object, which lets the engine key its maps on a plain
/// integer instead of on the node handle itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Opaque handle to a location in the externally mutated structure.
///
/// The engine never looks inside a node; it only compares ids and hands the
/// node back to the collaborator's parser or probe.
pub trait ObservedNode: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn node_id(&self) -> NodeId;
}

/// Identifier of one tracked lifetime of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which discovery strategy proposed a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Watch,
    Scan,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Watch => write!(f, "watch"),
            Origin::Scan => write!(f, "scan"),
        }
    }
}

// --- Parse results ---

/// Default acceptance bar for a candidate's parse score.
pub const DEFAULT_PARSE_THRESHOLD: f64 = 0.1;

/// Outcome of running a kind's extraction rules against one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    /// Extracted fields. Failed extractions are present as `Value::Null`.
    pub attributes: BTreeMap<String, Value>,
    /// Fraction of attempted extractions that succeeded, in `[0, 1]`.
    pub score: f64,
    /// Names of the extraction steps that failed.
    pub errors: Vec<String>,
}

impl ParseResult {
    pub fn builder() -> ParseResultBuilder {
        ParseResultBuilder::default()
    }

    /// A parse that attempted nothing. Never passes any threshold.
    pub fn empty() -> Self {
        Self {
            attributes: BTreeMap::new(),
            score: 0.0,
            errors: Vec::new(),
        }
    }

    pub fn passes(&self, threshold: f64) -> bool {
        self.score > threshold
    }

    /// String value of an attribute, if it was extracted as a string.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }
}

/// Tallies extraction attempts so collaborators never compute scores by hand.
#[derive(Debug, Default)]
pub struct ParseResultBuilder {
    attempts: u32,
    successes: u32,
    attributes: BTreeMap<String, Value>,
    errors: Vec<String>,
}

impl ParseResultBuilder {
    /// Record one extraction attempt. `None` counts as a failure.
    pub fn field(mut self, name: &str, value: Option<impl Into<Value>>) -> Self {
        self.attempts += 1;
        match value {
            Some(v) => {
                self.successes += 1;
                self.attributes.insert(name.to_string(), v.into());
            }
            None => {
                self.attributes.insert(name.to_string(), Value::Null);
                self.errors.push(name.to_string());
            }
        }
        self
    }

    /// Record one extraction attempt whose failure carries a reason.
    pub fn extract<T, E>(mut self, name: &str, value: Result<T, E>) -> Self
    where
        T: Into<Value>,
        E: fmt::Display,
    {
        self.attempts += 1;
        match value {
            Ok(v) => {
                self.successes += 1;
                self.attributes.insert(name.to_string(), v.into());
            }
            Err(e) => {
                self.attributes.insert(name.to_string(), Value::Null);
                self.errors.push(format!("{name}: {e}"));
            }
        }
        self
    }

    pub fn build(self) -> ParseResult {
        let score = if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        };
        ParseResult {
            attributes: self.attributes,
            score,
            errors: self.errors,
        }
    }
}
