use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use hostlens_common::ParseResult;
use hostlens_detect::{Appearance, EntityKind, TerminationSignal};
use hostlens_identity::key::fields;

use crate::host::{SimHost, SimNode};

/// Thread rows of a [`SimHost`] as an entity kind.
pub struct SimKind {
    host: Arc<SimHost>,
    name: String,
    watched: bool,
}

impl SimKind {
    pub fn new(host: Arc<SimHost>) -> Self {
        Self {
            host,
            name: "thread_row".to_string(),
            watched: true,
        }
    }

    /// Same rows, no watcher: the detector runs scanner-only.
    pub fn scanner_only(host: Arc<SimHost>) -> Self {
        Self {
            watched: false,
            ..Self::new(host)
        }
    }
}

#[async_trait]
impl EntityKind for SimKind {
    type Node = SimNode;

    fn name(&self) -> &str {
        &self.name
    }

    fn watch(&self) -> Option<BoxStream<'static, Appearance<SimNode>>> {
        self.watched.then(|| self.host.subscribe())
    }

    async fn scan(&self) -> Vec<SimNode> {
        self.host.attached()
    }

    fn parse(&self, node: &SimNode) -> ParseResult {
        ParseResult::builder()
            .field(fields::SUBJECT, self.host.field(*node, fields::SUBJECT))
            .field(fields::TIME_STRING, self.host.field(*node, fields::TIME_STRING))
            .field(fields::PEOPLE, self.host.field(*node, fields::PEOPLE))
            .build()
    }

    fn removal_signal(&self, node: &SimNode) -> TerminationSignal {
        self.host.removal_signal(*node)
    }
}
