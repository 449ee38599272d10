//! Session id generation.

use uuid::Uuid;

/// Separates the random part of an id from its node suffix.
pub const NODE_DELIMITER: char = '.';

/// Produces unguessable session ids, optionally tagged with a node suffix.
///
/// The random part is a v4 UUID rendered without hyphens (122 bits from the
/// OS random source). With a node configured, ids look like
/// `3f2a...c9.node0`, which lets an upstream load balancer route a client
/// back to the node holding its session.
#[derive(Debug, Clone, Default)]
pub struct SessionIdGenerator {
    node: Option<String>,
}

impl SessionIdGenerator {
    /// Create a generator. `node` is appended to every generated id.
    pub fn new(node: Option<String>) -> Self {
        Self { node }
    }

    /// The configured node suffix.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Generate a fresh id.
    pub fn generate(&self) -> String {
        with_suffix(random_part(), self.node.as_deref())
    }

    /// Generate a replacement for `old_id`, keeping its node suffix.
    ///
    /// Used to defeat session fixation: the client gets a new id while the
    /// session stays pinned to the same node. An id without a suffix gets
    /// this generator's node, if any.
    pub fn renew(&self, old_id: &str) -> String {
        let suffix = node_suffix_of(old_id).or(self.node.as_deref());
        with_suffix(random_part(), suffix)
    }
}

/// The node suffix of `id`, if it carries one.
pub fn node_suffix_of(id: &str) -> Option<&str> {
    id.rsplit_once(NODE_DELIMITER)
        .map(|(_, node)| node)
        .filter(|node| !node.is_empty())
}

/// The id without its node suffix.
pub fn cluster_id_of(id: &str) -> &str {
    id.rsplit_once(NODE_DELIMITER)
        .map(|(base, _)| base)
        .unwrap_or(id)
}

fn random_part() -> String {
    Uuid::new_v4().simple().to_string()
}

fn with_suffix(base: String, node: Option<&str>) -> String {
    match node {
        Some(node) => format!("{base}{NODE_DELIMITER}{node}"),
        None => base,
    }
}
