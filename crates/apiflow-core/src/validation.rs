use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Flow graph is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Duplicate node id {0}")]
    DuplicateNode(String),

    #[error("Node {id} has an invalid {kind} payload: {source}")]
    InvalidNode {
        id: String,
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Edge {edge} references unknown node {node}")]
    DanglingEdge { edge: String, node: String },
}
