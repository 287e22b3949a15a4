//! EIP-1459-style DNS discovery tree: publish a routing table snapshot as
//! signed TXT records, and resolve a remote tree back into `Node`s.

pub mod entry;
pub mod error;
pub mod provider;
pub mod publish;
pub mod resolve;

pub use entry::{BranchEntry, LinkEntry, NodesEntry, RootEntry, TreeEntry};
pub use error::{TreeError, TreeResult};
pub use provider::{AliyunProvider, DnsProvider, Route53Provider};
pub use publish::{build_tree, diff_and_plan, submit_plan, BuiltTree, PublishConfig, PublishPlan};
pub use resolve::{resolve_tree, StaticZone, TxtLookup};
