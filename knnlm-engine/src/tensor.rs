//! Dense row-major buffers used between the scorer and its providers.
//!
//! Only the shapes the scorer actually needs are modelled: a 2-D [`Matrix`]
//! for per-position values (targets, gathered probabilities) and a 3-D
//! [`Tensor3`] of `f32` for `(batch, time, feature)` activations. Both wrap
//! `ndarray` arrays kept in standard (row-major) layout, so feature rows are
//! always contiguous slices.

use ndarray::{Array2, Array3, ArrayView3, Axis, s};

use crate::error::{EvalError, Result};

/// Vocabulary index of a token.
pub type TokenId = u32;

/// Contiguous storage of an array built by this module.
fn standard<T>(slice: Option<T>) -> T {
    slice.expect("arrays are kept in standard layout")
}

/// Row-major 2-D buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    data: Array2<T>,
}

impl<T: Copy> Matrix<T> {
    /// Wrap `data` as a `rows × cols` matrix.
    pub fn new(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        let len = data.len();
        let data = Array2::from_shape_vec((rows, cols), data).map_err(|_| {
            EvalError::Shape(format!(
                "matrix {}x{} needs {} elements, got {}",
                rows,
                cols,
                rows * cols,
                len
            ))
        })?;
        Ok(Self { data })
    }

    /// A `rows × cols` matrix with every element set to `value`.
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self {
            data: Array2::from_elem((rows, cols), value),
        }
    }

    /// Build from equally sized rows.
    pub fn from_rows(rows: Vec<Vec<T>>) -> Result<Self> {
        let n_rows = rows.len();
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(n_rows * cols);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != cols {
                return Err(EvalError::Shape(format!(
                    "row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            data.extend(row);
        }
        Self::new(n_rows, cols, data)
    }

    /// Take ownership of an array, copying it into row-major order if needed.
    pub fn from_array(data: Array2<T>) -> Self {
        if data.is_standard_layout() {
            Self { data }
        } else {
            Self {
                data: data.as_standard_layout().into_owned(),
            }
        }
    }

    pub fn array(&self) -> &Array2<T> {
        &self.data
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[[row, col]]
    }

    pub fn row(&self, row: usize) -> &[T] {
        standard(self.data.row(row).to_slice())
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        standard(self.data.row_mut(row).into_slice())
    }

    /// Elements in row-major order.
    pub fn as_slice(&self) -> &[T] {
        standard(self.data.as_slice())
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        standard(self.data.as_slice_mut())
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data.into_raw_vec_and_offset().0
    }
}

/// Row-major `(d0, d1, d2)` tensor of `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor3 {
    data: Array3<f32>,
}

impl Tensor3 {
    pub fn new(dims: [usize; 3], data: Vec<f32>) -> Result<Self> {
        let len = data.len();
        let data = Array3::from_shape_vec((dims[0], dims[1], dims[2]), data).map_err(|_| {
            EvalError::Shape(format!(
                "tensor {:?} needs {} elements, got {}",
                dims,
                dims[0] * dims[1] * dims[2],
                len
            ))
        })?;
        Ok(Self { data })
    }

    pub fn zeros(dims: [usize; 3]) -> Self {
        Self {
            data: Array3::zeros((dims[0], dims[1], dims[2])),
        }
    }

    /// Take ownership of an array, copying it into row-major order if needed.
    pub fn from_array(data: Array3<f32>) -> Self {
        if data.is_standard_layout() {
            Self { data }
        } else {
            Self {
                data: data.as_standard_layout().into_owned(),
            }
        }
    }

    pub fn array(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn dims(&self) -> [usize; 3] {
        let (d0, d1, d2) = self.data.dim();
        [d0, d1, d2]
    }

    /// Innermost (feature) row at `(i, j)`.
    pub fn row(&self, i: usize, j: usize) -> &[f32] {
        standard(self.data.slice(s![i, j, ..]).to_slice())
    }

    pub fn row_mut(&mut self, i: usize, j: usize) -> &mut [f32] {
        standard(self.data.slice_mut(s![i, j, ..]).into_slice())
    }

    /// The `(d1, d2)` plane at index `i` of the leading axis.
    pub fn plane(&self, i: usize) -> Matrix<f32> {
        Matrix::from_array(self.data.index_axis(Axis(0), i).to_owned())
    }

    pub fn as_slice(&self) -> &[f32] {
        standard(self.data.as_slice())
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        standard(self.data.as_slice_mut())
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data.into_raw_vec_and_offset().0
    }

    pub fn view(&self) -> TensorView<'_> {
        TensorView {
            data: self.data.view(),
        }
    }

    /// Reinterpret with new dimensions covering the same number of elements.
    pub fn reshape(self, dims: [usize; 3]) -> Result<Self> {
        let from = self.dims();
        let data = self
            .data
            .into_shape_with_order((dims[0], dims[1], dims[2]))
            .map_err(|_| EvalError::Shape(format!("cannot reshape {:?} into {:?}", from, dims)))?;
        Ok(Self { data })
    }
}

/// Borrowed `(d0, d1, d2)` window over a [`Tensor3`] buffer.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    data: ArrayView3<'a, f32>,
}

impl<'a> TensorView<'a> {
    pub fn new(dims: [usize; 3], data: &'a [f32]) -> Result<Self> {
        let len = data.len();
        let data = ArrayView3::from_shape((dims[0], dims[1], dims[2]), data)
            .map_err(|_| EvalError::Shape(format!("view {:?} over {} elements", dims, len)))?;
        Ok(Self { data })
    }

    pub fn dims(&self) -> [usize; 3] {
        let (d0, d1, d2) = self.data.dim();
        [d0, d1, d2]
    }

    /// Number of feature rows, `d0 * d1`.
    pub fn num_rows(&self) -> usize {
        let [d0, d1, _] = self.dims();
        d0 * d1
    }

    /// Feature row by flattened `(d0, d1)` index.
    pub fn flat_row(&self, index: usize) -> &'a [f32] {
        let width = self.dims()[2];
        &self.as_slice()[index * width..(index + 1) * width]
    }

    pub fn as_slice(&self) -> &'a [f32] {
        standard(self.data.to_slice())
    }

    /// Collapse the leading two dimensions into one: `(1, d0 * d1, d2)`.
    pub fn flatten(self) -> TensorView<'a> {
        let shape = (1, self.num_rows(), self.dims()[2]);
        TensorView {
            data: standard(self.data.into_shape_with_order(shape).ok()),
        }
    }

    /// Rows `start..end` of the flattened view, shaped `(1, end - start, d2)`.
    pub fn slice_rows(self, start: usize, end: usize) -> TensorView<'a> {
        TensorView {
            data: self.flatten().data.slice_move(s![.., start..end, ..]),
        }
    }

    pub fn to_tensor(self) -> Tensor3 {
        Tensor3::from_array(self.data.to_owned())
    }
}
