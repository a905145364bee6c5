use test_case::test_case;

use crate::{
    error::EmaError,
    scope::Scope,
    store::VariableStore,
    tests::helpers::{assert_all_close, scalar, vector},
    weighted::weighted_moving_average,
};

#[test]
fn test_weighted_moving_average() {
    let mut store = VariableStore::new();
    let root = Scope::root();
    let decay = 0.5;
    let wma = weighted_moving_average(&mut store, &root, &[], &[], decay).unwrap();

    // first observation comes back exactly
    let (val_1, weight_1) = (3.0, 4.0);
    let result = wma.run(&mut store, &scalar(val_1), &scalar(weight_1)).unwrap();
    let numerator_1 = val_1 * weight_1 * (1.0 - decay);
    let denominator_1 = weight_1 * (1.0 - decay);
    assert_all_close(&result, &scalar(numerator_1 / denominator_1));
    assert_eq!(result, scalar(3.0));

    let (val_2, weight_2) = (11.0, 22.0);
    let result = wma.run(&mut store, &scalar(val_2), &scalar(weight_2)).unwrap();
    let numerator_2 = numerator_1 * decay + val_2 * weight_2 * (1.0 - decay);
    let denominator_2 = denominator_1 * decay + weight_2 * (1.0 - decay);
    assert_all_close(&result, &scalar(numerator_2 / denominator_2));
}

#[test]
fn test_zero_weight_yields_nan() {
    let mut store = VariableStore::new();
    let root = Scope::root();
    let wma = weighted_moving_average(&mut store, &root, &[], &[], 0.9).unwrap();

    let result = wma.run(&mut store, &scalar(5.0), &scalar(0.0)).unwrap();
    assert!(result.iter().all(|x| x.is_nan()));

    // a later nonzero weight makes the ratio well defined again
    let result = wma.run(&mut store, &scalar(5.0), &scalar(1.0)).unwrap();
    assert_all_close(&result, &scalar(5.0));
}

#[test]
fn test_each_call_site_gets_own_accumulators() {
    let mut store = VariableStore::new();
    let root = Scope::root();
    let first = weighted_moving_average(&mut store, &root, &[], &[], 0.5).unwrap();
    let second = weighted_moving_average(&mut store, &root, &[], &[], 0.5).unwrap();
    let scoped = weighted_moving_average(&mut store, &root.child("train"), &[], &[], 0.5).unwrap();

    assert_eq!(first.name(), "WeightedMovingAvg");
    assert_eq!(second.name(), "WeightedMovingAvg_1");
    assert_eq!(scoped.name(), "train/WeightedMovingAvg");
    assert_eq!(first.numerator().name(), "WeightedMovingAvg/value_x_weight");
    assert_eq!(first.denominator().name(), "WeightedMovingAvg/weight");

    first.run(&mut store, &scalar(1.0), &scalar(1.0)).unwrap();
    let result = second.run(&mut store, &scalar(7.0), &scalar(2.0)).unwrap();
    assert_all_close(&result, &scalar(7.0));
    assert!(!store.get(first.numerator()).unwrap().trainable());
}

#[test]
fn test_vector_value_with_scalar_weight() {
    let mut store = VariableStore::new();
    let root = Scope::root();
    let wma = weighted_moving_average(&mut store, &root, &[2], &[], 0.5).unwrap();

    wma.run(&mut store, &vector(&[2.0, 4.0]), &scalar(1.0)).unwrap();
    let result = wma.run(&mut store, &vector(&[4.0, 8.0]), &scalar(3.0)).unwrap();

    // numerator = [1, 2] * 0.5 + [12, 24] * 0.5, denominator = 0.5 * 0.5 + 1.5
    assert_all_close(&result, &vector(&[6.5 / 1.75, 13.0 / 1.75]));
}

#[test]
fn test_shape_errors() {
    let mut store = VariableStore::new();
    let root = Scope::root();
    assert!(matches!(
        weighted_moving_average(&mut store, &root, &[2], &[3], 0.5),
        Err(EmaError::ShapeMismatch { .. })
    ));
    assert!(store.global_variables().is_empty());

    let wma = weighted_moving_average(&mut store, &root, &[2], &[], 0.5).unwrap();
    let result = wma.run(&mut store, &vector(&[1.0, 2.0, 3.0]), &scalar(1.0));
    assert!(matches!(result, Err(EmaError::ShapeMismatch { .. })));
    assert_all_close(store.value(wma.numerator()).unwrap(), &vector(&[0.0, 0.0]));
}

#[test_case(&[], &[3] ; "scalar value vector weight")]
#[test_case(&[2, 1], &[3] ; "weight widens trailing axis")]
#[test_case(&[3], &[2, 3] ; "weight adds leading axis")]
fn test_weight_must_fit_value_shape(value_shape: &[usize], weight_shape: &[usize]) {
    let mut store = VariableStore::new();
    let root = Scope::root();
    let result = weighted_moving_average(&mut store, &root, value_shape, weight_shape, 0.5);
    assert!(matches!(result, Err(EmaError::ShapeMismatch { .. })));
    assert!(store.global_variables().is_empty());
}

#[test]
fn test_vector_weight_with_matrix_value() {
    let mut store = VariableStore::new();
    let root = Scope::root();
    let wma = weighted_moving_average(&mut store, &root, &[2, 3], &[3], 0.5).unwrap();
    let value = ndarray::ArrayD::from_elem(ndarray::IxDyn(&[2, 3]), 2.0);

    let result = wma.run(&mut store, &value, &vector(&[1.0, 2.0, 3.0])).unwrap();
    assert_eq!(result.shape(), &[2, 3]);
    assert_all_close(&result, &ndarray::ArrayD::from_elem(ndarray::IxDyn(&[2, 3]), 2.0));
}
