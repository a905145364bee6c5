use ndarray::{ArrayD, IxDyn};

pub fn scalar(value: f32) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(&[]), value)
}

pub fn vector(values: &[f32]) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
}

/// A scalar when `dim` is 1, otherwise a vector of `dim` copies.
pub fn repeat(value: f32, dim: usize) -> ArrayD<f32> {
    if dim == 1 {
        scalar(value)
    } else {
        ArrayD::from_elem(IxDyn(&[dim]), value)
    }
}

pub fn assert_all_close(actual: &ArrayD<f32>, expected: &ArrayD<f32>) {
    assert_eq!(actual.shape(), expected.shape(), "shapes differ");
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!(
            (a - e).abs() <= 1e-5 * (1.0 + e.abs()),
            "expected {expected:?}, got {actual:?}"
        );
    }
}
