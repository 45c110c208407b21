//! Dense row-major matrices and validated query input.
//!
//! [`Matrix`] is the in-memory form of every vector block that crosses the wire:
//! query batches, distance results and neighbour indices. [`QueryVectors`] is the
//! validated shape of a caller's query workload, either a single vector or a matrix
//! of vectors, always normalized to `f32`.
use std::ops::Range;

use log::warn;

use crate::error::{ClientError, Result};

/// Row-major matrix with a fixed column count.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> Matrix<T> {
    pub fn new(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(ClientError::InvalidArgument(format!(
                "matrix of shape [{rows}x{cols}] cannot hold {} values",
                data.len()
            )));
        }

        Ok(Self { rows, cols, data })
    }

    /// Empty matrix with `cols` columns, ready to have rows appended.
    pub fn empty(cols: usize) -> Self {
        Self {
            rows: 0,
            cols,
            data: Vec::new(),
        }
    }

    /// Build a matrix from equally sized rows.
    pub fn from_rows<R: AsRef<[T]>>(rows: &[R]) -> Result<Self> {
        let cols = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);

        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(ClientError::InvalidArgument(format!(
                    "row {i} has {} columns, expected {cols}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }

        Self::new(rows.len(), cols, data)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Row `i` as a slice.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.rows()`.
    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[T]> {
        // chunks_exact(0) panics, a zero column matrix has nothing to iterate.
        let chunk = self.cols.max(1);
        self.data.chunks_exact(chunk).take(self.rows)
    }

    /// Copy of a contiguous row range.
    ///
    /// # Panics
    ///
    /// Panics if `range` is decreasing or ends past `self.rows()`.
    pub fn slice_rows(&self, range: Range<usize>) -> Matrix<T> {
        let rows = range.end - range.start;
        Matrix {
            rows,
            cols: self.cols,
            data: self.data[range.start * self.cols..range.end * self.cols].to_vec(),
        }
    }

    /// Append the rows of `other` below the rows of `self`.
    pub fn append(&mut self, other: Matrix<T>) -> Result<()> {
        if other.cols != self.cols && !other.is_empty() {
            return Err(ClientError::InvalidArgument(format!(
                "cannot append rows with {} columns to a matrix with {} columns",
                other.cols, self.cols
            )));
        }

        self.rows += other.rows;
        self.data.extend(other.data);
        Ok(())
    }
}

/// Scalar element types accepted as query input.
pub trait Element: Copy {
    const NAME: &'static str;

    fn to_f32(self) -> f32;
}

macro_rules! impl_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                const NAME: &'static str = stringify!($t);

                fn to_f32(self) -> f32 {
                    self as f32
                }
            }
        )*
    };
}

impl_element!(f32, f64, i8, i16, i32, i64, u8, u16, u32, u64);

/// Query workload accepted by the batch engine.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryVectors {
    /// One query vector; bypasses batching.
    Single(Vec<f32>),
    /// One query vector per row.
    Batch(Matrix<f32>),
}

impl QueryVectors {
    /// Validate an n-dimensional input and normalize it to `f32`.
    ///
    /// Only rank 1 (a single vector) and rank 2 (a matrix of vectors) are accepted.
    /// Elements that are not `f32` are cast, with a warning.
    pub fn from_shape<E: Element>(shape: &[usize], data: &[E]) -> Result<Self> {
        let expected = shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d));
        if expected != Some(data.len()) {
            return Err(ClientError::InvalidArgument(format!(
                "shape {shape:?} does not match {} values",
                data.len()
            )));
        }

        if E::NAME != <f32 as Element>::NAME {
            warn!(
                "vectors are type {} but should be f32, casting vectors to f32",
                E::NAME
            );
        }
        let values: Vec<f32> = data.iter().map(|v| v.to_f32()).collect();

        match *shape {
            [_] => Ok(QueryVectors::Single(values)),
            [rows, cols] => Ok(QueryVectors::Batch(Matrix::new(rows, cols, values)?)),
            _ => Err(ClientError::InvalidArgument(format!(
                "query vectors must have 1 or 2 dimensions, got {}",
                shape.len()
            ))),
        }
    }

    /// Number of query vectors.
    pub fn len(&self) -> usize {
        match self {
            QueryVectors::Single(_) => 1,
            QueryVectors::Batch(m) => m.rows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        match self {
            QueryVectors::Single(v) => v.len(),
            QueryVectors::Batch(m) => m.cols(),
        }
    }
}

impl From<Vec<f32>> for QueryVectors {
    fn from(value: Vec<f32>) -> Self {
        QueryVectors::Single(value)
    }
}

impl From<Matrix<f32>> for QueryVectors {
    fn from(value: Matrix<f32>) -> Self {
        QueryVectors::Batch(value)
    }
}
