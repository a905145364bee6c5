use std::sync::Arc;

use ndarray::ArrayD;

use crate::error::Result;
use crate::store::{VarRef, VariableStore};

/// A deferred mutation of the store, triggered by the host once per step.
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, store: &mut VariableStore) -> Result<()>;
}

/// Overwrites `target` with a fixed value.
#[derive(Debug, Clone)]
pub struct Assign {
    name: String,
    target: VarRef,
    value: ArrayD<f32>,
}

impl Assign {
    pub fn new(target: &VarRef, value: ArrayD<f32>) -> Arc<dyn Operation> {
        Arc::new(Self {
            name: format!("{}/Assign", target.name()),
            target: target.clone(),
            value,
        })
    }
}

impl Operation for Assign {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, store: &mut VariableStore) -> Result<()> {
        store.assign(&self.target, &self.value)
    }
}

/// Adds a fixed delta to `target`.
#[derive(Debug, Clone)]
pub struct AssignAdd {
    name: String,
    target: VarRef,
    delta: ArrayD<f32>,
}

impl AssignAdd {
    pub fn new(target: &VarRef, delta: ArrayD<f32>) -> Arc<dyn Operation> {
        Arc::new(Self {
            name: format!("{}/AssignAdd", target.name()),
            target: target.clone(),
            delta,
        })
    }
}

impl Operation for AssignAdd {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, store: &mut VariableStore) -> Result<()> {
        store.assign_add(&self.target, &self.delta)
    }
}
