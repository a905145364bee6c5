use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EmaError, Result};
use crate::scope::{Device, Scope};

/// Identity of a variable or derived value. Unique within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u64);

/// A cheap handle to a variable held by a [`VariableStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarRef {
    id: ValueId,
    name: Arc<str>,
}

impl VarRef {
    pub fn id(&self) -> ValueId {
        self.id
    }

    /// The fully qualified name, e.g. `scope1/v0`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    handle: VarRef,
    value: ArrayD<f32>,
    trainable: bool,
    device: Option<Device>,
    colocate_with: Option<String>,
}

impl Variable {
    pub fn handle(&self) -> &VarRef {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Colocation groups in `loc:@<name>` form. A variable that was not
    /// created next to another one forms its own group.
    pub fn colocation_groups(&self) -> Vec<String> {
        vec![format!("loc:@{}", self.colocation_anchor())]
    }

    /// Name of the variable this one is placed next to, possibly itself.
    pub(crate) fn colocation_anchor(&self) -> &str {
        self.colocate_with.as_deref().unwrap_or(self.name())
    }
}

pub type ComputeFn = Arc<dyn Fn(&VariableStore) -> Result<ArrayD<f32>> + Send + Sync>;

/// A value recomputed from the store every time it is read.
#[derive(Clone)]
pub struct Derived {
    id: ValueId,
    name: Arc<str>,
    shape: Vec<usize>,
    compute: ComputeFn,
}

impl Derived {
    pub fn id(&self) -> ValueId {
        self.id
    }

    /// Name of the producing computation, e.g. `add` or `scope1/add_1`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn eval(&self, store: &VariableStore) -> Result<ArrayD<f32>> {
        let value = (self.compute)(store)?;
        if value.shape() != self.shape.as_slice() {
            return Err(EmaError::ShapeMismatch {
                expected: self.shape.clone(),
                got: value.shape().to_vec(),
            });
        }
        Ok(value)
    }
}

impl fmt::Debug for Derived {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shape", &self.shape)
            .finish()
    }
}

impl PartialEq for Derived {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Anything whose moving average can be tracked.
#[derive(Debug, Clone, PartialEq)]
pub enum Quantity {
    Persistent(VarRef),
    Derived(Derived),
}

impl Quantity {
    pub fn id(&self) -> ValueId {
        match self {
            Quantity::Persistent(var) => var.id(),
            Quantity::Derived(derived) => derived.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Quantity::Persistent(var) => var.name(),
            Quantity::Derived(derived) => derived.name(),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Quantity::Persistent(_))
    }

    pub fn as_variable(&self) -> Option<&VarRef> {
        match self {
            Quantity::Persistent(var) => Some(var),
            Quantity::Derived(_) => None,
        }
    }
}

impl From<VarRef> for Quantity {
    fn from(var: VarRef) -> Self {
        Quantity::Persistent(var)
    }
}

impl From<&VarRef> for Quantity {
    fn from(var: &VarRef) -> Self {
        Quantity::Persistent(var.clone())
    }
}

impl From<Derived> for Quantity {
    fn from(derived: Derived) -> Self {
        Quantity::Derived(derived)
    }
}

impl From<&Derived> for Quantity {
    fn from(derived: &Derived) -> Self {
        Quantity::Derived(derived.clone())
    }
}

/// Host-side state: every persistent value, by identity and by name.
///
/// User-facing constructors uniquify names the way a graph names its ops
/// (`v0`, `v0_1`, ...). Slots created by the averaging code go through
/// [`VariableStore::create_slot`] instead, which refuses to rename because
/// those names are part of the checkpoint format.
#[derive(Default)]
pub struct VariableStore {
    next_id: u64,
    variables: BTreeMap<ValueId, Variable>,
    by_name: HashMap<String, ValueId>,
    used_names: HashSet<String>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> ValueId {
        let id = ValueId(self.next_id);
        self.next_id += 1;
        id
    }

    fn unique_name(&mut self, name: String) -> String {
        if self.used_names.insert(name.clone()) {
            return name;
        }
        let mut suffix = 1;
        loop {
            let candidate = format!("{name}_{suffix}");
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
            suffix += 1;
        }
    }

    /// Reserves a uniquified name under `scope` without creating anything.
    pub(crate) fn unique_scope_name(&mut self, scope: &Scope, name: &str) -> String {
        self.unique_name(scope.join(name))
    }

    fn insert(
        &mut self,
        name: String,
        value: ArrayD<f32>,
        trainable: bool,
        device: Option<Device>,
        colocate_with: Option<String>,
    ) -> VarRef {
        let handle = VarRef {
            id: self.next_id(),
            name: name.as_str().into(),
        };
        self.by_name.insert(name, handle.id);
        self.variables.insert(
            handle.id,
            Variable {
                handle: handle.clone(),
                value,
                trainable,
                device,
                colocate_with,
            },
        );
        handle
    }

    /// Creates a trainable variable placed on the scope's device.
    pub fn variable(&mut self, scope: &Scope, name: &str, value: ArrayD<f32>) -> VarRef {
        let name = self.unique_name(scope.join(name));
        self.insert(name, value, true, scope.device().cloned(), None)
    }

    pub fn non_trainable_variable(
        &mut self,
        scope: &Scope,
        name: &str,
        value: ArrayD<f32>,
    ) -> VarRef {
        let name = self.unique_name(scope.join(name));
        self.insert(name, value, false, scope.device().cloned(), None)
    }

    /// Creates a non-trainable variable under exactly `name`.
    pub(crate) fn create_slot(
        &mut self,
        name: String,
        value: ArrayD<f32>,
        device: Option<Device>,
        colocate_with: Option<String>,
    ) -> Result<VarRef> {
        if !self.used_names.insert(name.clone()) {
            return Err(EmaError::DuplicateName(name));
        }
        debug!(slot = %name, shape = ?value.shape(), device = ?device, "created slot variable");
        Ok(self.insert(name, value, false, device, colocate_with))
    }

    /// Marks the current end of the store for [`VariableStore::discard_since`].
    pub(crate) fn mark(&self) -> ValueId {
        ValueId(self.next_id)
    }

    /// Drops every variable created after `mark` and frees its name.
    pub(crate) fn discard_since(&mut self, mark: ValueId) {
        let discarded = self.variables.split_off(&mark);
        for var in discarded.values() {
            self.by_name.remove(var.name());
            self.used_names.remove(var.name());
        }
        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "discarded variables");
        }
    }

    /// Registers a value computed by `compute` each time it is read.
    pub fn derived<F>(&mut self, scope: &Scope, name: &str, shape: &[usize], compute: F) -> Derived
    where
        F: Fn(&VariableStore) -> Result<ArrayD<f32>> + Send + Sync + 'static,
    {
        let id = self.next_id();
        let name = self.unique_name(scope.join(name));
        Derived {
            id,
            name: name.as_str().into(),
            shape: shape.to_vec(),
            compute: Arc::new(compute),
        }
    }

    /// Broadcasting elementwise sum, named `add`.
    pub fn add(&mut self, scope: &Scope, a: &Quantity, b: &Quantity) -> Result<Derived> {
        let shape = broadcast_shape(&self.shape_of(a)?, &self.shape_of(b)?)?;
        let (a, b) = (a.clone(), b.clone());
        Ok(self.derived(scope, "add", &shape, move |store| {
            let lhs = store.read(&a)?;
            let rhs = store.read(&b)?;
            Ok(&lhs + &rhs)
        }))
    }

    pub fn get(&self, var: &VarRef) -> Result<&Variable> {
        self.variables
            .get(&var.id)
            .ok_or(EmaError::UnknownVariable(var.id))
    }

    fn get_mut(&mut self, var: &VarRef) -> Result<&mut Variable> {
        self.variables
            .get_mut(&var.id)
            .ok_or(EmaError::UnknownVariable(var.id))
    }

    pub fn value(&self, var: &VarRef) -> Result<&ArrayD<f32>> {
        Ok(&self.get(var)?.value)
    }

    pub fn shape_of(&self, quantity: &Quantity) -> Result<Vec<usize>> {
        match quantity {
            Quantity::Persistent(var) => Ok(self.get(var)?.shape().to_vec()),
            Quantity::Derived(derived) => Ok(derived.shape().to_vec()),
        }
    }

    /// Current value of a variable, or a fresh evaluation of a derived value.
    pub fn read(&self, quantity: &Quantity) -> Result<ArrayD<f32>> {
        match quantity {
            Quantity::Persistent(var) => Ok(self.value(var)?.clone()),
            Quantity::Derived(derived) => derived.eval(self),
        }
    }

    /// Overwrites a variable. `value` is broadcast to the variable's shape.
    pub fn assign(&mut self, var: &VarRef, value: &ArrayD<f32>) -> Result<()> {
        let target = self.get_mut(var)?;
        target.value = broadcast_to(value, target.value.shape())?;
        Ok(())
    }

    pub fn assign_add(&mut self, var: &VarRef, delta: &ArrayD<f32>) -> Result<()> {
        let target = self.get_mut(var)?;
        let delta = broadcast_to(delta, target.value.shape())?;
        target.value += &delta;
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&VarRef> {
        self.by_name
            .get(name)
            .and_then(|id| self.variables.get(id))
            .map(Variable::handle)
    }

    /// All variables in creation order.
    pub fn global_variables(&self) -> Vec<VarRef> {
        self.variables.values().map(|v| v.handle.clone()).collect()
    }

    pub fn trainable_variables(&self) -> Vec<VarRef> {
        self.variables
            .values()
            .filter(|v| v.trainable)
            .map(|v| v.handle.clone())
            .collect()
    }
}

/// Broadcasts `value` onto `shape`, or reports which shapes disagreed.
pub(crate) fn broadcast_to(value: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    value
        .broadcast(IxDyn(shape))
        .map(|view| view.to_owned())
        .ok_or_else(|| EmaError::ShapeMismatch {
            expected: shape.to_vec(),
            got: value.shape().to_vec(),
        })
}

/// Result shape of combining `a` and `b` under numpy broadcasting rules.
pub(crate) fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut shape = vec![0; rank];
    for i in 0..rank {
        let x = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let y = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        shape[i] = match (x, y) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(EmaError::ShapeMismatch {
                    expected: a.to_vec(),
                    got: b.to_vec(),
                });
            }
        };
    }
    Ok(shape)
}
