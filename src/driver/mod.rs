//! Client driver for the rowlink wire protocol
//!
//! # Protocol Overview
//!
//! Every frame is a 1-byte tag followed by a payload whose shape the tag
//! fixes (see [`rowlink_core::catalog`]). A session opens with CREDENTIALS,
//! then runs exchanges one at a time:
//!
//! - **Request**: `MESSAGE(text)`
//! - **Outcome**: one of `QUERY` / `UPDATE` / `COMMAND`
//! - **Directive**: `PROCEED`, `PROCEED_WITH_IDS` or `CANCEL`
//! - **Response**: HEADER, HEADER_NAMES, RESULT, INT, INT_ARRAY and
//!   RESOURCE_DEMAND frames up to `END_OF_RESPONSE`, or an `EXCEPTION`

pub mod chain;
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod visitor;

pub use chain::{HandleChain, HandleId, NodeKind};
pub use connection::{Connection, Cursor, Execution, Statement};
pub use protocol::{Classifier, Protocol};
pub use registry::{ResourceRegistry, SessionHandle, SessionId};
pub use visitor::{
    CancelHandle, CollectingVisitor, InMemoryResources, NoResources, ResourceProvider,
    ResponseVisitor, Row,
};
