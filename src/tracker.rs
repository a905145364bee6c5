use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{ArrayD, IxDyn};
use tracing::{debug, trace};

use crate::assign::{AssignMovingAverage, commit};
use crate::config::DecayConfig;
use crate::error::{EmaError, Result};
use crate::ops::Operation;
use crate::scope::Scope;
use crate::store::{Quantity, ValueId, VarRef, VariableStore};

/// Everything kept for one tracked quantity.
#[derive(Debug, Clone)]
pub struct EmaState {
    source: Quantity,
    name: String,
    assign: AssignMovingAverage,
}

impl EmaState {
    pub fn source(&self) -> &Quantity {
        &self.source
    }

    /// Name of the average, fixed when the quantity was first applied.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn average(&self) -> &VarRef {
        self.assign.variable()
    }

    pub fn biased(&self) -> Option<&VarRef> {
        self.assign.debias_slots().map(|slots| &slots.biased)
    }

    pub fn local_step(&self) -> Option<&VarRef> {
        self.assign.debias_slots().map(|slots| &slots.local_step)
    }
}

/// Maintains shadow copies that follow tracked quantities with an
/// exponential decay.
///
/// Quantities are keyed by identity, never by name: two quantities from
/// different scopes may share a base name and still get separate state.
///
/// Averages of variables start from the variable's current value and are
/// never debiased. Averages of derived values start at zero and, with
/// `zero_debias`, carry hidden `biased`/`local_step` slots.
pub struct ExponentialMovingAverage {
    config: DecayConfig,
    scope: Scope,
    num_updates: Arc<AtomicU64>,
    states: BTreeMap<ValueId, EmaState>,
    moving_average_variables: Vec<VarRef>,
}

impl ExponentialMovingAverage {
    /// `scope` is used to preview names of quantities not yet applied.
    pub fn new(config: DecayConfig, scope: &Scope) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            num_updates: Arc::new(AtomicU64::new(config.num_updates.unwrap_or(0))),
            config,
            scope: scope.clone(),
            states: BTreeMap::new(),
            moving_average_variables: Vec::new(),
        })
    }

    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    /// Sets the step counter shared by every quantity in an update. Only
    /// consulted when the config enables `num_updates`.
    pub fn set_num_updates(&self, num_updates: u64) {
        self.num_updates.store(num_updates, Ordering::SeqCst);
    }

    pub fn num_updates(&self) -> Option<u64> {
        self.config
            .num_updates
            .map(|_| self.num_updates.load(Ordering::SeqCst))
    }

    /// Registers any quantity not seen before and returns an update that
    /// advances every quantity registered so far.
    ///
    /// New averages are named and placed using `scope`. A variable's average
    /// stays on the variable's device whatever device `scope` selects; a
    /// derived value's average goes to the scope's device. The returned update
    /// runs the scope's control dependencies first; initializing the averages
    /// does not wait on them.
    ///
    /// Registration is all or nothing: if any quantity fails, the averages
    /// and slots created by this call are removed and nothing is tracked.
    pub fn apply(
        &mut self,
        store: &mut VariableStore,
        quantities: &[Quantity],
        scope: &Scope,
    ) -> Result<EmaUpdate> {
        let mark = store.mark();
        let mut registered: Vec<EmaState> = Vec::new();
        for quantity in quantities {
            let id = quantity.id();
            if self.states.contains_key(&id) || registered.iter().any(|s| s.source.id() == id) {
                continue;
            }
            match self.register(store, quantity, scope) {
                Ok(state) => registered.push(state),
                Err(err) => {
                    store.discard_since(mark);
                    return Err(err);
                }
            }
        }

        for state in registered {
            if let Quantity::Persistent(var) = &state.source {
                self.moving_average_variables.push(var.clone());
            }
            self.states.insert(state.source.id(), state);
        }

        Ok(EmaUpdate {
            name: scope.join(&self.config.name),
            config: self.config.clone(),
            num_updates: Arc::clone(&self.num_updates),
            entries: self
                .states
                .values()
                .map(|state| (state.source.clone(), state.assign.clone()))
                .collect(),
            control_dependencies: scope.control_dependencies().to_vec(),
        })
    }

    fn register(
        &self,
        store: &mut VariableStore,
        quantity: &Quantity,
        scope: &Scope,
    ) -> Result<EmaState> {
        let name = self.name_under(scope, quantity);
        let (initial, device, colocate_with) = match quantity {
            Quantity::Persistent(var) => {
                let var = store.get(var)?;
                (
                    var.value().clone(),
                    var.device().or(scope.device()).cloned(),
                    Some(var.colocation_anchor().to_string()),
                )
            }
            Quantity::Derived(derived) => (
                ArrayD::zeros(IxDyn(derived.shape())),
                scope.device().cloned(),
                None,
            ),
        };

        let average = store.create_slot(name.clone(), initial, device, colocate_with)?;
        let zero_debias = self.config.zero_debias && !quantity.is_persistent();
        let assign = AssignMovingAverage::new(store, scope, &average, zero_debias)?;
        debug!(
            quantity = quantity.name(),
            average = %name,
            zero_debias,
            "tracking moving average"
        );

        Ok(EmaState {
            source: quantity.clone(),
            name,
            assign,
        })
    }

    fn name_under(&self, scope: &Scope, quantity: &Quantity) -> String {
        scope.join(&format!("{}/{}", quantity.name(), self.config.name))
    }

    pub fn state(&self, quantity: &Quantity) -> Option<&EmaState> {
        self.states.get(&quantity.id())
    }

    /// The variable holding `quantity`'s average.
    pub fn average(&self, quantity: &Quantity) -> Result<&VarRef> {
        self.state(quantity)
            .map(EmaState::average)
            .ok_or_else(|| EmaError::UnknownQuantity(quantity.name().to_string()))
    }

    /// Name of `quantity`'s average. Before `apply` this previews the name
    /// under the tracker's own scope.
    pub fn average_name(&self, quantity: &Quantity) -> String {
        match self.state(quantity) {
            Some(state) => state.name.clone(),
            None => self.name_under(&self.scope, quantity),
        }
    }

    /// Variables whose averages are tracked, in registration order.
    pub fn moving_average_variables(&self) -> &[VarRef] {
        &self.moving_average_variables
    }

    /// Maps checkpoint names to the variables they should be loaded into.
    ///
    /// For each quantity of `subset` (every tracked quantity by default):
    /// a variable's average name maps to the variable itself, so restoring
    /// swaps the raw value for its average; a derived value's average name
    /// maps to its average storage. Every other variable in the store whose
    /// name is not taken yet maps to itself, which brings along the hidden
    /// debias slots.
    pub fn variables_to_restore(
        &self,
        store: &VariableStore,
        subset: Option<&[Quantity]>,
    ) -> BTreeMap<String, Quantity> {
        let subset: Vec<Quantity> = match subset {
            Some(quantities) => quantities.to_vec(),
            None => self.states.values().map(|s| s.source.clone()).collect(),
        };

        let mut restore = BTreeMap::new();
        let mut covered = HashSet::new();
        for quantity in &subset {
            covered.insert(quantity.id());
            let target = match (quantity, self.state(quantity)) {
                (Quantity::Derived(_), Some(state)) => {
                    Quantity::Persistent(state.average().clone())
                }
                _ => quantity.clone(),
            };
            restore.insert(self.average_name(quantity), target);
        }

        for var in store.global_variables() {
            if covered.contains(&var.id()) {
                continue;
            }
            restore
                .entry(var.name().to_string())
                .or_insert_with(|| Quantity::Persistent(var.clone()));
        }
        restore
    }
}

/// One scheduled step of an [`ExponentialMovingAverage`].
///
/// Every source is read before any average is written, and nothing is
/// written unless every quantity's new value could be computed.
pub struct EmaUpdate {
    name: String,
    config: DecayConfig,
    num_updates: Arc<AtomicU64>,
    entries: Vec<(Quantity, AssignMovingAverage)>,
    control_dependencies: Vec<Arc<dyn Operation>>,
}

impl EmaUpdate {
    /// Number of quantities this update advances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn decay(&self) -> f32 {
        let num_updates = self
            .config
            .num_updates
            .map(|_| self.num_updates.load(Ordering::SeqCst));
        self.config.effective_decay(num_updates)
    }
}

impl Operation for EmaUpdate {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, store: &mut VariableStore) -> Result<()> {
        for dependency in &self.control_dependencies {
            dependency.run(store)?;
        }

        let decay = self.decay();
        let observations = self
            .entries
            .iter()
            .map(|(source, _)| store.read(source))
            .collect::<Result<Vec<_>>>()?;

        let mut writes = Vec::new();
        for ((_, assign), observation) in self.entries.iter().zip(&observations) {
            writes.extend(assign.prepare(store, observation, decay)?);
        }
        commit(store, writes)?;

        trace!(update = %self.name, decay, quantities = self.entries.len(), "moving averages updated");
        Ok(())
    }
}
