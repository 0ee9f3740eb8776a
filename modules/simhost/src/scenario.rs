//! Scenario description: the rows a simulated host starts with.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hostlens_identity::key::fields;

use crate::host::{ClickHandler, SimHost, SimNode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rows: Vec<SimRow>,
}

/// One thread row. Missing text fields simulate rows the extraction rules
/// only partly match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimRow {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub people: Option<String>,
    /// Durable id; a clickable row navigates to `#thread/<id>`.
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default = "default_clickable")]
    pub clickable: bool,
    /// Overrides the handler derived from `thread_id`.
    #[serde(default)]
    pub handler: Option<ClickHandler>,
    /// Inserted without notifying watchers.
    #[serde(default)]
    pub unobserved: bool,
}

fn default_clickable() -> bool {
    true
}

impl SimRow {
    pub fn fields(&self) -> BTreeMap<String, String> {
        [
            (fields::SUBJECT, &self.subject),
            (fields::TIME_STRING, &self.time),
            (fields::PEOPLE, &self.people),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.clone().map(|v| (name.to_string(), v)))
        .collect()
    }

    pub fn click_handler(&self) -> Option<ClickHandler> {
        if let Some(handler) = &self.handler {
            return Some(handler.clone());
        }
        if !self.clickable {
            return None;
        }
        self.thread_id
            .as_ref()
            .map(|id| ClickHandler::Navigate(format!("#thread/{id}")))
    }
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse scenario")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_json(&text)
    }

    /// Insert every row into `host`, in order.
    pub fn populate(&self, host: &SimHost) -> Vec<SimNode> {
        self.rows
            .iter()
            .map(|row| {
                if row.unobserved {
                    host.insert_unobserved(row.fields(), row.click_handler())
                } else {
                    host.insert(row.fields(), row.click_handler())
                }
            })
            .collect()
    }

    /// Fresh host holding this scenario's rows.
    pub fn build(&self) -> (Arc<SimHost>, Vec<SimNode>) {
        let host = SimHost::new();
        let nodes = self.populate(&host);
        (host, nodes)
    }
}
