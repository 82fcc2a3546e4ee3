//! Dense row-major tensors over `f64` with right-aligned broadcasting.
//!
//! All fluents are carried as real-valued tensors (booleans as 0.0/1.0), so a
//! single element type is enough for the whole pipeline.

use std::collections::BTreeMap;

use thiserror::Error;

/// A mapping from variable name to its tensor value.
///
/// `BTreeMap` keeps iteration order deterministic, which matters wherever the
/// order feeds a PRNG or a finite-difference sweep.
pub type TensorMap = BTreeMap<String, Tensor>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("cannot broadcast shapes {lhs:?} and {rhs:?}")]
    Broadcast { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    Shape {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("unknown variable <{name}>")]
    UnknownVariable { name: String },
    #[error("empty input for {what}")]
    Empty { what: &'static str },
    #[error("axis operation on rank-0 tensor: {what}")]
    NoAxis { what: &'static str },
}

/// Row-major dense tensor. Rank 0 is a scalar with one element.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    pub fn scalar(v: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![v],
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: &[usize], v: f64) -> Self {
        let n: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![v; n],
        }
    }

    pub fn from_vec(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, RuntimeError> {
        let n: usize = shape.iter().product();
        if n != data.len() {
            return Err(RuntimeError::Shape {
                what: "from_vec",
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Scalar value of a one-element tensor.
    pub fn item(&self) -> Result<f64, RuntimeError> {
        if self.data.len() == 1 {
            Ok(self.data[0])
        } else {
            Err(RuntimeError::Shape {
                what: "item",
                expected: vec![],
                got: self.shape.clone(),
            })
        }
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Elementwise combine with numpy-style right-aligned broadcasting.
    pub fn zip(&self, other: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor, RuntimeError> {
        // Fast paths: identical shapes and scalar operands.
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Ok(Tensor {
                shape: self.shape.clone(),
                data,
            });
        }
        if other.is_scalar() {
            let b = other.data[0];
            return Ok(self.map(|a| f(a, b)));
        }
        if self.is_scalar() {
            let a = self.data[0];
            return Ok(other.map(|b| f(a, b)));
        }

        let shape = broadcast_shape(&self.shape, &other.shape)?;
        let sa = broadcast_strides(&self.shape, &shape);
        let sb = broadcast_strides(&other.shape, &shape);
        let n: usize = shape.iter().product();
        let mut data = Vec::with_capacity(n);
        let mut idx = vec![0usize; shape.len()];
        for _ in 0..n {
            let mut ia = 0;
            let mut ib = 0;
            for d in 0..shape.len() {
                ia += idx[d] * sa[d];
                ib += idx[d] * sb[d];
            }
            data.push(f(self.data[ia], other.data[ib]));
            for d in (0..shape.len()).rev() {
                idx[d] += 1;
                if idx[d] < shape[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
        Ok(Tensor { shape, data })
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, RuntimeError> {
        self.zip(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, RuntimeError> {
        self.zip(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, RuntimeError> {
        self.zip(other, |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor, RuntimeError> {
        self.zip(other, |a, b| a / b)
    }

    /// Clip every element into `[lo, hi]`.
    pub fn clamp(&self, lo: f64, hi: f64) -> Tensor {
        self.map(|x| x.clamp(lo, hi))
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            0.0
        } else {
            self.sum() / self.data.len() as f64
        }
    }

    /// Length of the trailing axis, if any.
    pub fn last_dim(&self) -> Option<usize> {
        self.shape.last().copied()
    }

    /// Fold the trailing axis away: out[..] = fold(f, init, in[.., :]).
    pub fn reduce_last_axis(
        &self,
        init: f64,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Tensor, RuntimeError> {
        let k = self.shape.last().copied().ok_or(RuntimeError::NoAxis {
            what: "reduce_last_axis",
        })?;
        let out_shape = self.shape[..self.shape.len() - 1].to_vec();
        let data = if k == 0 {
            vec![init; out_shape.iter().product()]
        } else {
            self.data
                .chunks(k)
                .map(|c| c.iter().fold(init, |acc, &x| f(acc, x)))
                .collect()
        };
        Ok(Tensor {
            shape: out_shape,
            data,
        })
    }

    /// Slice index `i` of the leading axis, dropping that axis.
    pub fn index_axis0(&self, i: usize) -> Result<Tensor, RuntimeError> {
        let d0 = self.shape.first().copied().ok_or(RuntimeError::NoAxis {
            what: "index_axis0",
        })?;
        if i >= d0 {
            return Err(RuntimeError::Shape {
                what: "index_axis0",
                expected: vec![d0],
                got: vec![i],
            });
        }
        let stride: usize = self.shape[1..].iter().product();
        Ok(Tensor {
            shape: self.shape[1..].to_vec(),
            data: self.data[i * stride..(i + 1) * stride].to_vec(),
        })
    }

    /// Stack equally shaped tensors along a new leading axis.
    pub fn stack(parts: &[Tensor]) -> Result<Tensor, RuntimeError> {
        let first = parts.first().ok_or(RuntimeError::Empty { what: "stack" })?;
        let mut shape = Vec::with_capacity(first.rank() + 1);
        shape.push(parts.len());
        shape.extend_from_slice(&first.shape);
        let mut data = Vec::with_capacity(first.len() * parts.len());
        for p in parts {
            if p.shape != first.shape {
                return Err(RuntimeError::Shape {
                    what: "stack",
                    expected: first.shape.clone(),
                    got: p.shape.clone(),
                });
            }
            data.extend_from_slice(&p.data);
        }
        Ok(Tensor { shape, data })
    }

    /// Stack equally shaped tensors along a new trailing axis.
    pub fn stack_last(parts: &[Tensor]) -> Result<Tensor, RuntimeError> {
        let first = parts
            .first()
            .ok_or(RuntimeError::Empty { what: "stack_last" })?;
        let k = parts.len();
        for p in parts {
            if p.shape != first.shape {
                return Err(RuntimeError::Shape {
                    what: "stack_last",
                    expected: first.shape.clone(),
                    got: p.shape.clone(),
                });
            }
        }
        let mut shape = first.shape.clone();
        shape.push(k);
        let mut data = Vec::with_capacity(first.len() * k);
        for i in 0..first.len() {
            for p in parts {
                data.push(p.data[i]);
            }
        }
        Ok(Tensor { shape, data })
    }

    /// Max absolute difference, or `None` if shapes differ.
    pub fn max_abs_diff(&self, other: &Tensor) -> Option<f64> {
        if self.shape != other.shape {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| (a - b).abs())
                .fold(0.0, f64::max),
        )
    }
}

fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, RuntimeError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0usize; rank];
    for d in 0..rank {
        let a = dim_from_right(lhs, rank, d);
        let b = dim_from_right(rhs, rank, d);
        out[d] = if a == b || b == 1 {
            a
        } else if a == 1 {
            b
        } else {
            return Err(RuntimeError::Broadcast {
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
            });
        };
    }
    Ok(out)
}

fn dim_from_right(shape: &[usize], rank: usize, d: usize) -> usize {
    // Right-align `shape` under an output of rank `rank`; missing dims are 1.
    let pad = rank - shape.len();
    if d < pad {
        1
    } else {
        shape[d - pad]
    }
}

fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let rank = out.len();
    let pad = rank - shape.len();
    // Row-major strides of the input, right-aligned; broadcast dims get stride 0.
    let mut strides = vec![0usize; rank];
    let mut acc = 1usize;
    for d in (0..shape.len()).rev() {
        strides[pad + d] = if shape[d] == 1 { 0 } else { acc };
        acc *= shape[d];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_same_shape_and_scalar() {
        let a = Tensor::from_vec(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::scalar(10.0);
        let c = a.add(&b).unwrap();
        assert_eq!(c.data(), &[11.0, 12.0, 13.0, 14.0]);
        let d = a.mul(&a).unwrap();
        assert_eq!(d.data(), &[1.0, 4.0, 9.0, 16.0]);
    }

    #[test]
    fn zip_broadcasts_leading_batch_axis() {
        // [2, 3] (batched state) against [3] (unbatched action).
        let a = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(vec![3], vec![10.0, 20.0, 30.0]).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.data(), &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn zip_rejects_incompatible_shapes() {
        let a = Tensor::zeros(&[2, 3]);
        let b = Tensor::zeros(&[4]);
        assert!(matches!(
            a.add(&b),
            Err(RuntimeError::Broadcast { .. })
        ));
    }

    #[test]
    fn reduce_last_axis_sums_rows() {
        let a = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let s = a.reduce_last_axis(0.0, |acc, x| acc + x).unwrap();
        assert_eq!(s.shape(), &[2]);
        assert_eq!(s.data(), &[6.0, 15.0]);
    }

    #[test]
    fn stack_and_index_axis0_round_trip() {
        let a = Tensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(vec![2], vec![3.0, 4.0]).unwrap();
        let s = Tensor::stack(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.index_axis0(0).unwrap(), a);
        assert_eq!(s.index_axis0(1).unwrap(), b);
    }

    #[test]
    fn stack_last_interleaves() {
        let a = Tensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(vec![2], vec![3.0, 4.0]).unwrap();
        let s = Tensor::stack_last(&[a, b]).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.data(), &[1.0, 3.0, 2.0, 4.0]);
    }
}
