//! Caller-side hooks for a streamed response.

use std::collections::HashMap;
use std::fmt;
use std::ops::Index;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rowlink_core::{ScalarType, Value};

/// One decoded RESULT frame, typed by the header that preceded it.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str("\t")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

/// Receives the frames of a response in order.
///
/// The `bool` returned by the `on_*` callbacks decides whether streaming
/// continues (`true`) or yields back to the caller with the exchange still
/// open (`false`).
pub trait ResponseVisitor: Send {
    fn on_header(&mut self, _types: &[ScalarType]) -> bool {
        true
    }

    fn on_header_names(&mut self, _names: &[String]) -> bool {
        true
    }

    fn on_row(&mut self, row: Row) -> bool;

    /// Update counts (INT) and generated ids (INT_ARRAY).
    fn on_ints(&mut self, _values: &[i32]) -> bool {
        true
    }

    /// Bytes to send back for a RESOURCE_DEMAND.
    fn on_resource_demand(&mut self, _name: &str) -> Bytes {
        Bytes::new()
    }

    /// Polled once per frame.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Cooperative cancellation signal shared between a caller and a visitor.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Supplies named resources the server asks for mid-response.
pub trait ResourceProvider: Send + Sync {
    fn resource(&self, name: &str) -> Option<Bytes>;
}

/// Answers every demand with nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResources;

impl ResourceProvider for NoResources {
    fn resource(&self, _name: &str) -> Option<Bytes> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryResources {
    entries: HashMap<String, Bytes>,
}

impl InMemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, data: impl Into<Bytes>) {
        self.entries.insert(name.to_string(), data.into());
    }

    pub fn with(mut self, name: &str, data: impl Into<Bytes>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResourceProvider for InMemoryResources {
    fn resource(&self, name: &str) -> Option<Bytes> {
        self.entries.get(name).cloned()
    }
}

/// Buffers everything a response carries.
#[derive(Default)]
pub struct CollectingVisitor {
    pub types: Vec<ScalarType>,
    pub names: Vec<String>,
    pub rows: Vec<Row>,
    pub ints: Vec<i32>,
    /// Names of the resources the server asked for, in order.
    pub demanded: Vec<String>,
    resources: Option<Arc<dyn ResourceProvider>>,
    cancel: Option<CancelHandle>,
    row_limit: Option<usize>,
}

impl CollectingVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceProvider>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Yield after this many rows have been buffered in one call.
    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }
}

impl ResponseVisitor for CollectingVisitor {
    fn on_header(&mut self, types: &[ScalarType]) -> bool {
        self.types = types.to_vec();
        true
    }

    fn on_header_names(&mut self, names: &[String]) -> bool {
        self.names = names.to_vec();
        true
    }

    fn on_row(&mut self, row: Row) -> bool {
        self.rows.push(row);
        self.row_limit.map_or(true, |limit| self.rows.len() < limit)
    }

    fn on_ints(&mut self, values: &[i32]) -> bool {
        self.ints.extend_from_slice(values);
        true
    }

    fn on_resource_demand(&mut self, name: &str) -> Bytes {
        self.demanded.push(name.to_string());
        self.resources
            .as_ref()
            .and_then(|r| r.resource(name))
            .unwrap_or_default()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_access_and_display() {
        let row = Row::new(vec![Value::Int(42), Value::Text("ok".into()), Value::Null]);
        assert_eq!(row.len(), 3);
        assert_eq!(row[0], Value::Int(42));
        assert_eq!(row.get(1).and_then(|v| v.as_str()), Some("ok"));
        assert_eq!(row.get(3), None);
        assert_eq!(row.to_string(), "42\tok\tNULL");
    }

    #[test]
    fn test_resources() {
        let resources = InMemoryResources::new().with("schema.json", &b"{}"[..]);
        assert_eq!(resources.resource("schema.json"), Some(Bytes::from_static(b"{}")));
        assert_eq!(resources.resource("missing"), None);
        assert_eq!(NoResources.resource("anything"), None);

        let mut visitor = CollectingVisitor::new().with_resources(Arc::new(resources));
        assert_eq!(visitor.on_resource_demand("schema.json").as_ref(), b"{}");
        assert!(visitor.on_resource_demand("missing").is_empty());
        assert_eq!(visitor.demanded, vec!["schema.json", "missing"]);
    }

    #[test]
    fn test_cancel_handle_shared() {
        let cancel = CancelHandle::new();
        let visitor = CollectingVisitor::new().with_cancel(cancel.clone());
        assert!(!visitor.is_cancelled());
        cancel.cancel();
        assert!(visitor.is_cancelled());
        cancel.reset();
        assert!(!visitor.is_cancelled());
    }

    #[test]
    fn test_row_limit_yields() {
        let mut visitor = CollectingVisitor::new().with_row_limit(2);
        assert!(visitor.on_row(Row::new(vec![Value::Int(1)])));
        assert!(!visitor.on_row(Row::new(vec![Value::Int(2)])));
    }
}
