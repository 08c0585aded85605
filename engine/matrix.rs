use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s};
use sprs::{CsMat, TriMat};

/// Unified design matrix representation for dense and sparse workflows.
///
/// Sparse matrices are always held in CSR layout so row-wise kernels can walk
/// `outer_iterator` directly.
#[derive(Clone, Debug)]
pub enum DesignMatrix {
    Dense(Array2<f64>),
    Sparse(CsMat<f64>),
}

impl From<Array2<f64>> for DesignMatrix {
    fn from(matrix: Array2<f64>) -> Self {
        Self::Dense(matrix)
    }
}

impl DesignMatrix {
    pub fn sparse(matrix: CsMat<f64>) -> Self {
        if matrix.is_csr() {
            Self::Sparse(matrix)
        } else {
            Self::Sparse(matrix.to_other_storage())
        }
    }

    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.nrows(),
            Self::Sparse(matrix) => matrix.rows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.ncols(),
            Self::Sparse(matrix) => matrix.cols(),
        }
    }

    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            Self::Dense(matrix) => matrix.clone(),
            Self::Sparse(matrix) => {
                let mut dense = Array2::<f64>::zeros((matrix.rows(), matrix.cols()));
                for (row, entries) in matrix.outer_iterator().enumerate() {
                    for (col, &value) in entries.iter() {
                        dense[(row, col)] += value;
                    }
                }
                dense
            }
        }
    }

    /// Computes `X v`. The caller guarantees `v.len() == self.ncols()`.
    pub fn matrix_vector_multiply(&self, vector: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.dot(&vector),
            Self::Sparse(matrix) => {
                let mut output = Array1::<f64>::zeros(matrix.rows());
                for (row, entries) in matrix.outer_iterator().enumerate() {
                    output[row] = entries
                        .iter()
                        .map(|(col, &value)| value * vector[col])
                        .sum();
                }
                output
            }
        }
    }

    /// Computes `Xᵗ v`. The caller guarantees `v.len() == self.nrows()`.
    pub fn transpose_vector_multiply(&self, vector: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.t().dot(&vector),
            Self::Sparse(matrix) => {
                let mut output = Array1::<f64>::zeros(matrix.cols());
                for (row, entries) in matrix.outer_iterator().enumerate() {
                    let scale = vector[row];
                    for (col, &value) in entries.iter() {
                        output[col] += value * scale;
                    }
                }
                output
            }
        }
    }

    /// Computes the unnormalized Gram matrix `XᵗX`.
    pub fn gram(&self) -> Array2<f64> {
        match self {
            Self::Dense(matrix) => matrix.t().dot(matrix),
            Self::Sparse(matrix) => sparse_weighted_gram(matrix, None),
        }
    }

    /// Computes `Xᵗ diag(w) X` without materializing the diagonal.
    pub fn weighted_gram(&self, weights: ArrayView1<f64>) -> Array2<f64> {
        match self {
            Self::Dense(matrix) => {
                let wx = matrix * &weights.insert_axis(Axis(1));
                matrix.t().dot(&wx)
            }
            Self::Sparse(matrix) => sparse_weighted_gram(matrix, Some(weights)),
        }
    }
}

// Accumulates the outer product of every sparse row; block-diagonal designs keep each
// row's support inside one block so the work stays proportional to the block widths.
fn sparse_weighted_gram(matrix: &CsMat<f64>, weights: Option<ArrayView1<f64>>) -> Array2<f64> {
    let mut gram = Array2::<f64>::zeros((matrix.cols(), matrix.cols()));
    for (row, entries) in matrix.outer_iterator().enumerate() {
        let weight = weights.map_or(1.0, |w| w[row]);
        for (i, &xi) in entries.iter() {
            let scaled = weight * xi;
            for (j, &xj) in entries.iter() {
                gram[(i, j)] += scaled * xj;
            }
        }
    }
    gram
}

/// Assembles a sparse block-diagonal design where block `k` owns its own rows and columns.
pub fn block_diagonal(blocks: &[ArrayView2<f64>]) -> DesignMatrix {
    let nrows: usize = blocks.iter().map(|b| b.nrows()).sum();
    let ncols: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut triplets = TriMat::new((nrows, ncols));

    let mut row_offset = 0;
    let mut col_offset = 0;
    for block in blocks {
        for ((i, j), &value) in block.indexed_iter() {
            if value != 0.0 {
                triplets.add_triplet(row_offset + i, col_offset + j, value);
            }
        }
        row_offset += block.nrows();
        col_offset += block.ncols();
    }

    let csr: CsMat<f64> = triplets.to_csr();
    DesignMatrix::Sparse(csr)
}

/// Prepends an intercept column of ones.
pub fn add_bias(x: ArrayView2<f64>) -> Array2<f64> {
    let mut biased = Array2::<f64>::ones((x.nrows(), x.ncols() + 1));
    biased.slice_mut(s![.., 1..]).assign(&x);
    biased
}

/// Prepends an intercept column to every slice of a `batch × samples × features` stack.
pub fn add_bias_batched(x: ArrayView3<f64>) -> Array3<f64> {
    let (batch, nsample, ndims) = x.dim();
    let mut biased = Array3::<f64>::ones((batch, nsample, ndims + 1));
    biased.slice_mut(s![.., .., 1..]).assign(&x);
    biased
}

/// Keeps only the rows where the response and every covariate are finite.
///
/// A missing genotype call drops the sample for that variant only, which is how
/// blocked designs end up with unequal per-block sample counts.
///
/// # Panics
///
/// Panics if `y.len() != x.nrows()`; callers validate shapes first.
pub fn complete_rows(x: ArrayView2<f64>, y: ArrayView1<f64>) -> (Array2<f64>, Array1<f64>) {
    let keep: Vec<usize> = (0..x.nrows())
        .filter(|&row| y[row].is_finite() && x.row(row).iter().all(|v| v.is_finite()))
        .collect();
    (x.select(Axis(0), &keep), y.select(Axis(0), &keep))
}
