//! Error types for the DNS discovery tree.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("malformed tree entry: {0}")]
    Malformed(String),

    #[error("signature verification failed on root entry")]
    InvalidSignature,

    #[error("root seq {0} is not newer than last seen seq {1}")]
    StaleSeq(u64, u64),

    #[error("a Nodes leaf was found in the links subtree")]
    NodesInLinkTree,

    #[error("a Link entry was found in the nodes subtree")]
    LinkInNodesTree,

    #[error("resolution exceeded max depth {0}")]
    MaxDepthExceeded(usize),

    #[error("hash {0} could not be resolved")]
    UnresolvedHash(String),

    #[error("DNS provider error: {0}")]
    Provider(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

pub type TreeResult<T> = Result<T, TreeError>;
