//! `$`-prefixed variables that outlive a single expression.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::value::ValueType;

/// One persistent variable and its current bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentVariable
{
    pub name: String,
    pub ty: ValueType,
    pub bytes: Vec<u8>,
}

/// Persistent variables of a target
#[derive(Debug, Default)]
pub struct PersistentVariables
{
    variables: Mutex<Vec<PersistentVariable>>,
    next_result: AtomicU32,
}

impl PersistentVariables
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Name for the next expression result: `$0`, `$1`, ...
    pub fn next_result_name(&self) -> String
    {
        format!("${}", self.next_result.fetch_add(1, Ordering::SeqCst))
    }

    /// Create `name`, replacing any variable of that name.
    pub fn create(&self, name: &str, ty: ValueType, bytes: Vec<u8>)
    {
        let mut variables = self.lock();
        variables.retain(|variable| variable.name != name);
        variables.push(PersistentVariable {
            name: name.to_string(),
            ty,
            bytes,
        });
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<PersistentVariable>
    {
        self.lock()
            .iter()
            .find(|variable| variable.name == name)
            .cloned()
    }

    /// Replace the bytes of `name`. Returns whether it exists.
    pub fn update_bytes(&self, name: &str, bytes: Vec<u8>) -> bool
    {
        match self.lock().iter_mut().find(|variable| variable.name == name) {
            Some(variable) => {
                variable.bytes = bytes;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn names(&self) -> Vec<String>
    {
        self.lock()
            .iter()
            .map(|variable| variable.name.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PersistentVariable>>
    {
        self.variables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
