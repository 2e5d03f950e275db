use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::{EngineErr, Result};

/// A dense, row-major `f32` tensor.
///
/// Scalars have an empty shape and exactly one element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a new `Tensor`.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The row-major values.
    ///
    /// # Returns
    /// A new tensor or an error if the amount of values doesn't match the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();

        if expected != data.len() {
            return Err(EngineErr::ShapeMismatch {
                what: "tensor data",
                got: vec![data.len()],
                expected: vec![expected],
            });
        }

        Ok(Self { shape, data })
    }

    /// Creates a scalar tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// Creates a one dimensional tensor.
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Creates a two dimensional tensor of `rows` x `cols`.
    pub fn matrix(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        Self::new(vec![rows, cols], data)
    }

    /// The value-less tensor returned by ops that only have side effects.
    pub fn empty() -> Self {
        Self {
            shape: vec![0],
            data: Vec::new(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the single value of a tensor holding exactly one element.
    pub fn to_scalar(&self) -> Result<f32> {
        match self.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(EngineErr::ShapeMismatch {
                what: "scalar",
                got: self.shape.clone(),
                expected: Vec::new(),
            }),
        }
    }

    /// Returns `true` if any of the values is `NaN`.
    pub fn has_nan(&self) -> bool {
        self.data.iter().any(|x| x.is_nan())
    }

    /// Views the tensor as a matrix, vectors are seen as a single column.
    pub fn view2(&self) -> Result<ArrayView2<'_, f32>> {
        let dim = match self.shape.as_slice() {
            [rows, cols] => (*rows, *cols),
            [rows] => (*rows, 1),
            [] => (1, 1),
            other => {
                return Err(EngineErr::ShapeMismatch {
                    what: "matrix view",
                    got: other.to_vec(),
                    expected: vec![0, 0],
                });
            }
        };

        ArrayView2::from_shape(dim, &self.data)
            .map_err(|e| EngineErr::Internal(format!("invalid matrix view: {e}")))
    }

    /// Views the tensor as a flat vector.
    pub fn view1(&self) -> ArrayView1<'_, f32> {
        ArrayView1::from(self.data.as_slice())
    }

    pub fn from_array1(array: Array1<f32>) -> Self {
        Self::vector(array.to_vec())
    }

    pub fn from_array2(array: Array2<f32>) -> Self {
        let (rows, cols) = array.dim();

        Self {
            shape: vec![rows, cols],
            data: array.iter().copied().collect(),
        }
    }
}

impl From<f32> for Tensor {
    fn from(value: f32) -> Self {
        Self::scalar(value)
    }
}

impl From<Vec<f32>> for Tensor {
    fn from(data: Vec<f32>) -> Self {
        Self::vector(data)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn mismatched_data_is_rejected() {
        assert!(Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]).is_err());
        assert!(Tensor::matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]).is_ok());
    }

    #[test]
    fn scalars_have_an_empty_shape() {
        let t = Tensor::scalar(3.5);
        assert!(t.shape().is_empty());
        assert_eq!(t.to_scalar().unwrap(), 3.5);
        assert!(Tensor::vector(vec![1.0, 2.0]).to_scalar().is_err());
    }

    #[test]
    fn vectors_are_viewed_as_columns() {
        let t = Tensor::vector(vec![1.0, 2.0, 3.0]);
        let view = t.view2().unwrap();
        assert_eq!(view.dim(), (3, 1));
        assert_eq!(view[[2, 0]], 3.0);
    }

    #[test]
    fn transposed_arrays_keep_logical_order() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let t = Tensor::from_array2(a.t().to_owned());
        assert_eq!(t.data(), [1.0, 3.0, 2.0, 4.0]);

        let t = Tensor::from_array2(a.reversed_axes());
        assert_eq!(t.shape(), [2, 2]);
        assert_eq!(t.data(), [1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn nan_detection() {
        assert!(Tensor::vector(vec![1.0, f32::NAN]).has_nan());
        assert!(!Tensor::scalar(0.0).has_nan());
    }
}
