//! Central-difference Jacobians through a pose perturbation operator.

use nalgebra::{DMatrix, DVector};

/// Jacobian of `f` at `delta = 0`, where `f` maps a tangent-space delta of
/// length `dof` to a residual vector.
///
/// Returns `None` as soon as `f` does.
pub fn central_difference<F>(dof: usize, step: f64, mut f: F) -> Option<DMatrix<f64>>
where
    F: FnMut(&[f64]) -> Option<DVector<f64>>,
{
    let mut delta = vec![0.0; dof];
    let mut columns = Vec::with_capacity(dof);
    for k in 0..dof {
        delta[k] = step;
        let plus = f(&delta)?;
        delta[k] = -step;
        let minus = f(&delta)?;
        delta[k] = 0.0;
        columns.push((plus - minus) / (2.0 * step));
    }
    if columns.is_empty() {
        return Some(DMatrix::zeros(0, 0));
    }
    Some(DMatrix::from_columns(&columns))
}
