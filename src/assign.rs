use ndarray::{ArrayD, IxDyn};
use tracing::trace;

use crate::error::{EmaError, Result};
use crate::scope::Scope;
use crate::store::{VarRef, VariableStore, broadcast_to};

/// Hidden state that lets a zero-initialized average report unbiased values.
///
/// `biased` holds the plain recurrence; `local_step` counts the updates
/// folded into it and has the same element type as the average.
#[derive(Debug, Clone, PartialEq)]
pub struct DebiasSlots {
    pub biased: VarRef,
    pub local_step: VarRef,
}

impl DebiasSlots {
    /// Finds or creates `<scope>/<variable>/biased` and
    /// `<scope>/<variable>/local_step`, placed with `variable`.
    ///
    /// An existing variable is only reused when it is non-trainable and has
    /// the slot's shape. Both names are checked before either is created.
    fn resolve(store: &mut VariableStore, scope: &Scope, variable: &VarRef) -> Result<Self> {
        let (shape, device, anchor) = {
            let var = store.get(variable)?;
            (
                var.shape().to_vec(),
                var.device().cloned(),
                var.colocation_anchor().to_string(),
            )
        };
        let prefix = scope.join(variable.name());
        let biased_name = format!("{prefix}/biased");
        let local_step_name = format!("{prefix}/local_step");

        let biased = existing_slot(store, &biased_name, &shape)?;
        let local_step = existing_slot(store, &local_step_name, &[])?;

        let biased = match biased {
            Some(var) => var,
            None => store.create_slot(
                biased_name,
                ArrayD::zeros(IxDyn(&shape)),
                device.clone(),
                Some(anchor.clone()),
            )?,
        };
        let local_step = match local_step {
            Some(var) => var,
            None => store.create_slot(
                local_step_name,
                ArrayD::zeros(IxDyn(&[])),
                device,
                Some(anchor),
            )?,
        };

        Ok(Self { biased, local_step })
    }
}

/// Returns the variable already holding slot `name`, if any. A trainable
/// variable under that name is a user variable and cannot serve as a slot.
fn existing_slot(
    store: &VariableStore,
    name: &str,
    shape: &[usize],
) -> Result<Option<VarRef>> {
    let Some(handle) = store.lookup(name) else {
        return Ok(None);
    };
    let var = store.get(handle)?;
    if var.trainable() {
        return Err(EmaError::DuplicateName(name.to_string()));
    }
    if var.shape() != shape {
        return Err(EmaError::ShapeMismatch {
            expected: shape.to_vec(),
            got: var.shape().to_vec(),
        });
    }
    Ok(Some(handle.clone()))
}

/// A moving-average assignment bound to one variable, built once and run
/// once per step.
#[derive(Debug, Clone)]
pub struct AssignMovingAverage {
    variable: VarRef,
    shape: Vec<usize>,
    debias: Option<DebiasSlots>,
}

impl AssignMovingAverage {
    pub fn new(
        store: &mut VariableStore,
        scope: &Scope,
        variable: &VarRef,
        zero_debias: bool,
    ) -> Result<Self> {
        let shape = store.get(variable)?.shape().to_vec();
        let debias = if zero_debias {
            Some(DebiasSlots::resolve(store, scope, variable)?)
        } else {
            None
        };
        Ok(Self {
            variable: variable.clone(),
            shape,
            debias,
        })
    }

    pub fn variable(&self) -> &VarRef {
        &self.variable
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn debias_slots(&self) -> Option<&DebiasSlots> {
        self.debias.as_ref()
    }

    /// Computes every write of one step without touching the store.
    pub(crate) fn prepare(
        &self,
        store: &VariableStore,
        value: &ArrayD<f32>,
        decay: f32,
    ) -> Result<Vec<(VarRef, ArrayD<f32>)>> {
        let value = broadcast_to(value, &self.shape)?;
        let one_minus_decay = 1.0 - decay;

        let Some(slots) = &self.debias else {
            let current = store.value(&self.variable)?;
            let updated = current - &((current - &value) * one_minus_decay);
            return Ok(vec![(self.variable.clone(), updated)]);
        };

        let local_step = scalar(store.value(&slots.local_step)?) + 1.0;
        let biased = store.value(&slots.biased)?;
        let biased = biased - &((biased - &value) * one_minus_decay);
        let unbiased = &biased / (1.0 - decay.powf(local_step));
        Ok(vec![
            (
                slots.local_step.clone(),
                ArrayD::from_elem(IxDyn(&[]), local_step),
            ),
            (slots.biased.clone(), biased),
            (self.variable.clone(), unbiased),
        ])
    }

    /// Folds `value` into the variable and returns its handle.
    pub fn run(&self, store: &mut VariableStore, value: &ArrayD<f32>, decay: f32) -> Result<VarRef> {
        let writes = self.prepare(store, value, decay)?;
        commit(store, writes)?;
        trace!(variable = self.variable.name(), decay, "assigned moving average");
        Ok(self.variable.clone())
    }
}

pub(crate) fn commit(store: &mut VariableStore, writes: Vec<(VarRef, ArrayD<f32>)>) -> Result<()> {
    for (var, value) in writes {
        store.assign(&var, &value)?;
    }
    Ok(())
}

fn scalar(value: &ArrayD<f32>) -> f32 {
    value.iter().next().copied().unwrap_or(0.0)
}

/// Moves `variable` toward `value`:
/// `variable <- variable - (1 - decay) * (variable - value)`.
///
/// With `zero_debias` the recurrence runs on a hidden `biased` accumulator
/// and the variable receives `biased / (1 - decay^t)`, where `t` counts the
/// calls made so far for this variable under this scope. The hidden slots
/// are created on the first call and reused afterwards.
///
/// Fails with `ShapeMismatch` before any state is created or written when
/// `value` does not broadcast to the variable's shape.
pub fn assign_moving_average(
    store: &mut VariableStore,
    scope: &Scope,
    variable: &VarRef,
    value: &ArrayD<f32>,
    decay: f32,
    zero_debias: bool,
) -> Result<VarRef> {
    broadcast_to(value, store.get(variable)?.shape())?;
    AssignMovingAverage::new(store, scope, variable, zero_debias)?.run(store, value, decay)
}
