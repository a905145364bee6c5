use crate::{
    checkpoint::Checkpoint,
    config::DecayConfig,
    error::EmaError,
    ops::Operation,
    scope::Scope,
    store::{Quantity, VariableStore},
    tests::helpers::{assert_all_close, scalar, vector},
    tracker::ExponentialMovingAverage,
};

/// Trains `w` for two steps and returns the encoded checkpoint.
fn trained_checkpoint() -> Vec<u8> {
    let mut store = VariableStore::new();
    let root = Scope::root();
    let w = store.variable(&root, "w", vector(&[1.0, 2.0]));
    let q = Quantity::from(&w);
    let mut ema = ExponentialMovingAverage::new(DecayConfig::new(0.5), &root).unwrap();
    let update = ema.apply(&mut store, &[q.clone()], &root).unwrap();

    store.assign(&w, &vector(&[3.0, 4.0])).unwrap();
    update.run(&mut store).unwrap();
    store.assign(&w, &vector(&[5.0, 6.0])).unwrap();
    update.run(&mut store).unwrap();

    // average: [2, 3] then [3.5, 4.5]
    let avg = ema.average(&q).unwrap();
    assert_all_close(store.value(avg).unwrap(), &vector(&[3.5, 4.5]));

    Checkpoint::save(&store).unwrap().to_bytes().unwrap()
}

#[test]
fn test_restore_averages_into_fresh_model() {
    let bytes = trained_checkpoint();
    let checkpoint = Checkpoint::from_bytes(&bytes).unwrap();
    assert_eq!(
        checkpoint.names().collect::<Vec<_>>(),
        vec!["w", "w/ExponentialMovingAverage"]
    );

    // an inference model has only the raw weight
    let mut store = VariableStore::new();
    let root = Scope::root();
    let w = store.variable(&root, "w", vector(&[0.0, 0.0]));
    let ema = ExponentialMovingAverage::new(DecayConfig::new(0.5), &root).unwrap();
    let restore = ema.variables_to_restore(&store, Some(&[Quantity::from(&w)]));

    let loaded = checkpoint.restore(&mut store, &restore).unwrap();
    assert_eq!(loaded, 1);
    assert_all_close(store.value(&w).unwrap(), &vector(&[3.5, 4.5]));
}

#[test]
fn test_restore_missing_entry() {
    let checkpoint = Checkpoint::from_bytes(&trained_checkpoint()).unwrap();

    let mut store = VariableStore::new();
    let root = Scope::root();
    let w = store.variable(&root, "w", vector(&[0.0, 0.0]));
    store.variable(&root, "extra", scalar(1.0));
    let ema = ExponentialMovingAverage::new(DecayConfig::new(0.5), &root).unwrap();
    let restore = ema.variables_to_restore(&store, Some(&[Quantity::from(&w)]));

    let result = checkpoint.restore(&mut store, &restore);
    assert!(matches!(result, Err(EmaError::MissingCheckpointEntry(name)) if name == "extra"));
    // nothing was loaded
    assert_all_close(store.value(&w).unwrap(), &vector(&[0.0, 0.0]));
}

#[test]
fn test_restore_shape_mismatch() {
    let checkpoint = Checkpoint::from_bytes(&trained_checkpoint()).unwrap();

    let mut store = VariableStore::new();
    let root = Scope::root();
    let w = store.variable(&root, "w", vector(&[0.0, 0.0, 0.0]));
    let ema = ExponentialMovingAverage::new(DecayConfig::new(0.5), &root).unwrap();
    let restore = ema.variables_to_restore(&store, Some(&[Quantity::from(&w)]));

    let result = checkpoint.restore(&mut store, &restore);
    assert!(matches!(result, Err(EmaError::ShapeMismatch { .. })));
}

#[test]
fn test_restore_skips_unallocated_derived() {
    let checkpoint = Checkpoint::from_bytes(&trained_checkpoint()).unwrap();

    let mut store = VariableStore::new();
    let root = Scope::root();
    let w = Quantity::from(store.variable(&root, "w", vector(&[0.0, 0.0])));
    let doubled = Quantity::from(store.add(&root, &w, &w).unwrap());
    let ema = ExponentialMovingAverage::new(DecayConfig::new(0.5), &root).unwrap();
    let restore = ema.variables_to_restore(&store, Some(&[w.clone(), doubled]));

    assert_eq!(checkpoint.restore(&mut store, &restore).unwrap(), 1);
}

#[test]
fn test_corrupt_checkpoint() {
    let mut bytes = trained_checkpoint();
    bytes.truncate(bytes.len() / 2);
    assert!(matches!(
        Checkpoint::from_bytes(&bytes),
        Err(EmaError::Decode(_))
    ));
}
