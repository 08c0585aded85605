//! Sufficient statistics for least squares.
//!
//! `XᵗX` and `Xᵗy` are linear in the rows of the data, so statistics computed on
//! disjoint sample partitions add up to the statistics of the pooled data. These are
//! pure functions with no shared state.

use crate::matrix::DesignMatrix;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, Zip};

pub fn unnorm_autocovariance(x: &DesignMatrix) -> Array2<f64> {
    x.gram()
}

pub fn unnorm_covariance(x: &DesignMatrix, y: ArrayView1<f64>) -> Array1<f64> {
    x.transpose_vector_multiply(y)
}

/// `XᵗX` of every slice of a `batch × samples × features` stack.
pub fn batched_unnorm_autocovariance(x: ArrayView3<f64>) -> Array3<f64> {
    let (batch, _, ndims) = x.dim();
    let mut out = Array3::<f64>::zeros((batch, ndims, ndims));
    Zip::from(out.axis_iter_mut(Axis(0)))
        .and(x.axis_iter(Axis(0)))
        .par_for_each(|mut target, xs| target.assign(&xs.t().dot(&xs)));
    out
}

/// `Xᵗy` of every slice, with `y` shaped `batch × samples`.
pub fn batched_unnorm_covariance(x: ArrayView3<f64>, y: ArrayView2<f64>) -> Array2<f64> {
    let (batch, _, ndims) = x.dim();
    let mut out = Array2::<f64>::zeros((batch, ndims));
    Zip::from(out.axis_iter_mut(Axis(0)))
        .and(x.axis_iter(Axis(0)))
        .and(y.axis_iter(Axis(0)))
        .par_for_each(|mut target, xs, ys| target.assign(&xs.t().dot(&ys)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};

    #[test]
    fn statistics_are_additive_over_sample_partitions() {
        let x = Array2::from_shape_fn((9, 3), |(i, j)| ((i * 7 + j * 3) % 5) as f64 - 1.5);
        let y = Array1::from_shape_fn(9, |i| i as f64 * 0.5 - 2.0);

        let whole = DesignMatrix::from(x.clone());
        let first = DesignMatrix::from(x.slice(s![..4, ..]).to_owned());
        let second = DesignMatrix::from(x.slice(s![4.., ..]).to_owned());

        let xtx = unnorm_autocovariance(&first) + unnorm_autocovariance(&second);
        let xty = unnorm_covariance(&first, y.slice(s![..4]))
            + unnorm_covariance(&second, y.slice(s![4..]));

        assert_eq!(xtx, unnorm_autocovariance(&whole));
        assert_eq!(xty, unnorm_covariance(&whole, y.view()));
    }

    #[test]
    fn batched_statistics_match_per_slice_statistics() {
        let x = Array3::from_shape_fn((4, 5, 2), |(b, i, j)| (b as f64) - (i * j) as f64);
        let y = Array2::from_shape_fn((4, 5), |(b, i)| (b + i) as f64);

        let xtx = batched_unnorm_autocovariance(x.view());
        let xty = batched_unnorm_covariance(x.view(), y.view());
        assert_eq!(xtx.dim(), (4, 2, 2));
        assert_eq!(xty.dim(), (4, 2));

        for unit in 0..4 {
            let design = DesignMatrix::from(x.index_axis(Axis(0), unit).to_owned());
            assert_eq!(xtx.index_axis(Axis(0), unit), unnorm_autocovariance(&design));
            assert_eq!(
                xty.index_axis(Axis(0), unit),
                unnorm_covariance(&design, y.row(unit))
            );
        }
        assert_eq!(xty.row(0), array![0.0, -30.0]);
    }
}
