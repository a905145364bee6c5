use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EmaError, Result};
use crate::store::{Quantity, VariableStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SavedTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl SavedTensor {
    fn from_array(value: &ArrayD<f32>) -> Self {
        Self {
            shape: value.shape().to_vec(),
            data: value.iter().copied().collect(),
        }
    }

    fn to_array(&self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|_| {
            EmaError::ShapeMismatch {
                expected: self.shape.clone(),
                got: vec![self.data.len()],
            }
        })
    }
}

/// Values of every variable in a store, keyed by variable name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    entries: BTreeMap<String, SavedTensor>,
}

pub fn to_bincode_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        value,
        bincode::config::standard(),
    )?)
}

pub fn from_bincode_bytes<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::serde::borrow_decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(EmaError::from)
}

impl Checkpoint {
    pub fn save(store: &VariableStore) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for var in store.global_variables() {
            let value = store.value(&var)?;
            entries.insert(var.name().to_string(), SavedTensor::from_array(value));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Result<ArrayD<f32>> {
        self.entries
            .get(name)
            .ok_or_else(|| EmaError::MissingCheckpointEntry(name.to_string()))?
            .to_array()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_bincode_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        from_bincode_bytes(bytes)
    }

    /// Loads the entry named by each key of `restore` into its target
    /// variable. Derived targets have no storage and are skipped.
    ///
    /// Every entry is checked before anything is written. Returns the number
    /// of variables loaded.
    pub fn restore(
        &self,
        store: &mut VariableStore,
        restore: &BTreeMap<String, Quantity>,
    ) -> Result<usize> {
        let mut writes = Vec::new();
        for (name, target) in restore {
            let Quantity::Persistent(var) = target else {
                continue;
            };
            let value = self.get(name)?;
            let expected = store.get(var)?.shape();
            if value.shape() != expected {
                return Err(EmaError::ShapeMismatch {
                    expected: expected.to_vec(),
                    got: value.shape().to_vec(),
                });
            }
            writes.push((var, value));
        }

        for (var, value) in &writes {
            store.assign(var, value)?;
        }
        debug!(restored = writes.len(), "checkpoint restored");
        Ok(writes.len())
    }
}
