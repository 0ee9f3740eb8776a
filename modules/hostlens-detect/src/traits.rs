// Collaborator boundary for one entity kind.
//
// The extraction rules for a given host version (what a list row looks like,
// how to find every row, how to read its fields) live behind EntityKind.
// The detector only sees nodes, removal signals and parse scores.

use async_trait::async_trait;
use futures::stream::BoxStream;

use hostlens_common::{ObservedNode, ParseResult};

use crate::lifetime::TerminationSignal;
use crate::merger::Appearance;

#[async_trait]
pub trait EntityKind: Send + Sync + 'static {
    type Node: ObservedNode;

    /// Name used in logs and diagnostics (e.g. "thread_row").
    fn name(&self) -> &str;

    /// Live stream of raw appearances driven by structural mutation
    /// notifications. `None` means this kind has no watcher and the
    /// detector runs scanner-only.
    fn watch(&self) -> Option<BoxStream<'static, Appearance<Self::Node>>>;

    /// Complete current set of matching nodes.
    async fn scan(&self) -> Vec<Self::Node>;

    /// Run the extraction rules against a node.
    fn parse(&self, node: &Self::Node) -> ParseResult;

    /// Structural removal notification for a node the scanner discovered.
    fn removal_signal(&self, node: &Self::Node) -> TerminationSignal;
}
