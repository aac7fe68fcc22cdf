pub mod config;
pub mod driver;
pub mod error;

pub use config::ConnectionConfig;
pub use driver::{
    CancelHandle, Connection, Cursor, Execution, HandleChain, HandleId, InMemoryResources,
    NodeKind, Protocol, ResourceProvider, ResourceRegistry, ResponseVisitor, Row, Statement,
};
pub use error::{DriverError, DriverResult};
pub use rowlink_core::{Directive, Outcome, ScalarType, Value};
