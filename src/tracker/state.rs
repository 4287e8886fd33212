//! Per-case attribute storage
//!
//! Test cases keep their working data in a [`CaseState`]. At teardown the
//! tracker writes every plain-data attribute into the lock, so a replayed run
//! can start from it. Collaborators (page objects, driver handles) are held in
//! the same map but marked as never snapshotted.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

/// An attribute held by a test case between steps
pub trait CaseAttribute: Any + Send + Sync {
    /// JSON form written to the lock, or `None` if the attribute must never
    /// be persisted
    fn snapshot(&self) -> Option<Result<Value, serde_json::Error>>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Serializable data kept by a test case
#[derive(Debug, Clone, PartialEq)]
pub struct Data<T>(pub T);

impl<T> CaseAttribute for Data<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn snapshot(&self) -> Option<Result<Value, serde_json::Error>> {
        Some(serde_json::to_value(&self.0))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A collaborator object that is never written to a lock
#[derive(Debug)]
pub struct Collaborator<T>(pub T);

impl<T> CaseAttribute for Collaborator<T>
where
    T: Send + Sync + 'static,
{
    fn snapshot(&self) -> Option<Result<Value, serde_json::Error>> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Named attributes of a running test case.
///
/// Names starting with `_` are private: they are never snapshotted even when
/// they hold plain data.
#[derive(Default)]
pub struct CaseState {
    attributes: BTreeMap<String, Box<dyn CaseAttribute>>,
}

impl fmt::Debug for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseState")
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CaseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store plain data under `name`, replacing any previous attribute
    pub fn set<T>(&mut self, name: impl Into<String>, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.attributes.insert(name.into(), Box::new(Data(value)));
    }

    /// Store a collaborator under `name`
    pub fn attach<T>(&mut self, name: impl Into<String>, collaborator: T)
    where
        T: Send + Sync + 'static,
    {
        self.attributes
            .insert(name.into(), Box::new(Collaborator(collaborator)));
    }

    pub fn insert_attribute(&mut self, name: impl Into<String>, attribute: Box<dyn CaseAttribute>) {
        self.attributes.insert(name.into(), attribute);
    }

    /// Borrow the value stored under `name` as a `T`
    pub fn get<T: 'static>(&self, name: &str) -> Option<&T> {
        let any = self.attributes.get(name)?.as_any();
        any.downcast_ref::<Data<T>>()
            .map(|d| &d.0)
            .or_else(|| any.downcast_ref::<Collaborator<T>>().map(|c| &c.0))
    }

    pub fn get_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        let any = self.attributes.get_mut(name)?.as_any_mut();
        if any.is::<Data<T>>() {
            return any.downcast_mut::<Data<T>>().map(|d| &mut d.0);
        }
        any.downcast_mut::<Collaborator<T>>().map(|c| &mut c.0)
    }

    /// JSON form of a plain-data attribute
    pub fn value(&self, name: &str) -> Option<Value> {
        self.attributes.get(name)?.snapshot()?.ok()
    }

    /// Decode a plain-data attribute into `T`.
    ///
    /// Useful for attributes imported from a prior lock, which arrive as raw
    /// JSON values.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        serde_json::from_value(self.value(name)?).ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.attributes.remove(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Public plain-data attributes with their JSON encoding attempt
    pub fn snapshot(&self) -> Vec<(String, Result<Value, serde_json::Error>)> {
        self.attributes
            .iter()
            .filter(|(name, _)| !name.starts_with('_'))
            .filter_map(|(name, attr)| attr.snapshot().map(|value| (name.clone(), value)))
            .collect()
    }
}
