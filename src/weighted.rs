use ndarray::{ArrayD, IxDyn};
use tracing::debug;

use crate::assign::{AssignMovingAverage, commit};
use crate::error::{EmaError, Result};
use crate::scope::Scope;
use crate::store::{VarRef, VariableStore, broadcast_shape, broadcast_to};

/// A decay-weighted average normalized by the decayed sum of weights.
///
/// Both accumulators start at zero and decay together, so their ratio needs
/// no bias correction: the first run returns the observed value itself.
#[derive(Debug, Clone)]
pub struct WeightedMovingAverage {
    name: String,
    decay: f32,
    numerator: AssignMovingAverage,
    denominator: AssignMovingAverage,
}

/// Allocates the accumulators for one weighted moving average.
///
/// Every call gets its own site under `scope`: `WeightedMovingAvg`,
/// `WeightedMovingAvg_1`, and so on. The site holds `value_x_weight` (shaped
/// like the value) and `weight` (shaped like the weight).
///
/// The weight must broadcast onto the value's shape, since the numerator
/// stores their product.
pub fn weighted_moving_average(
    store: &mut VariableStore,
    scope: &Scope,
    value_shape: &[usize],
    weight_shape: &[usize],
    decay: f32,
) -> Result<WeightedMovingAverage> {
    let combined = broadcast_shape(value_shape, weight_shape)?;
    if combined != value_shape {
        return Err(EmaError::ShapeMismatch {
            expected: value_shape.to_vec(),
            got: combined,
        });
    }

    let name = store.unique_scope_name(scope, "WeightedMovingAvg");
    let device = scope.device().cloned();
    let numerator = store.create_slot(
        format!("{name}/value_x_weight"),
        ArrayD::zeros(IxDyn(value_shape)),
        device.clone(),
        None,
    )?;
    let denominator = store.create_slot(
        format!("{name}/weight"),
        ArrayD::zeros(IxDyn(weight_shape)),
        device,
        None,
    )?;
    debug!(site = %name, decay, "weighted moving average allocated");

    Ok(WeightedMovingAverage {
        decay,
        numerator: AssignMovingAverage::new(store, scope, &numerator, false)?,
        denominator: AssignMovingAverage::new(store, scope, &denominator, false)?,
        name,
    })
}

impl WeightedMovingAverage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    pub fn numerator(&self) -> &VarRef {
        self.numerator.variable()
    }

    pub fn denominator(&self) -> &VarRef {
        self.denominator.variable()
    }

    /// Folds one weighted observation in and returns `numerator / denominator`.
    ///
    /// The division is unguarded: while every weight seen so far is zero the
    /// result is NaN.
    pub fn run(
        &self,
        store: &mut VariableStore,
        value: &ArrayD<f32>,
        weight: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        let value = broadcast_to(value, self.numerator.shape())?;
        let weight = broadcast_to(weight, self.denominator.shape())?;
        let value_x_weight = &value * &weight;

        let mut writes = self.numerator.prepare(store, &value_x_weight, self.decay)?;
        writes.extend(self.denominator.prepare(store, &weight, self.decay)?);
        commit(store, writes)?;

        let numerator = store.value(self.numerator.variable())?;
        let denominator = store.value(self.denominator.variable())?;
        Ok(numerator / denominator)
    }
}
