use ndarray::prelude::*;
use ndarray::{IxDyn, Zip};

use super::error::{GraphError, Result};

/// Sorts and deduplicates `axes`; an empty list stands for every axis.
pub fn normalize_axes(axes: &[usize], rank: usize) -> Result<Vec<usize>> {
    if axes.is_empty() {
        return Ok((0..rank).collect());
    }
    let mut normalized = Vec::with_capacity(axes.len());
    for &axis in axes {
        if axis >= rank {
            return Err(GraphError::InvalidAxis {
                axis: axis as isize,
                rank,
            });
        }
        if !normalized.contains(&axis) {
            normalized.push(axis);
        }
    }
    normalized.sort_unstable();
    Ok(normalized)
}

/// Resolves a possibly negative (counted from the end) axis.
pub fn resolve_axis(axis: isize, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved >= rank as isize {
        Err(GraphError::InvalidAxis { axis, rank })
    } else {
        Ok(resolved as usize)
    }
}

pub fn inverse_permutation(permutation: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; permutation.len()];
    for (i, &p) in permutation.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

pub fn standardize(view: ArrayViewD<f64>) -> ArrayD<f64> {
    view.as_standard_layout().into_owned()
}

pub fn sign(x: f64) -> f64 {
    if x > 0. {
        1.
    } else if x < 0. {
        -1.
    } else {
        0.
    }
}

/// How an array splits into "lanes" for a reduction: the kept axes index the
/// lanes (in their original order), the reduced axes index the elements of
/// each lane in C order.
#[derive(Debug, Clone)]
pub struct LaneLayout {
    shape: Vec<usize>,
    kept: Vec<usize>,
    reduced: Vec<usize>,
}

impl LaneLayout {
    pub fn new(shape: &[usize], axes: &[usize]) -> Result<Self> {
        let reduced = normalize_axes(axes, shape.len())?;
        let kept = (0..shape.len())
            .filter(|axis| !reduced.contains(axis))
            .collect();
        Ok(Self {
            shape: shape.to_vec(),
            kept,
            reduced,
        })
    }

    fn permutation(&self) -> Vec<usize> {
        self.kept
            .iter()
            .chain(self.reduced.iter())
            .copied()
            .collect()
    }

    pub fn lane_count(&self) -> usize {
        self.kept.iter().map(|&axis| self.shape[axis]).product()
    }

    pub fn lane_length(&self) -> usize {
        self.reduced.iter().map(|&axis| self.shape[axis]).product()
    }

    pub fn output_shape(&self, keep_dims: bool) -> Vec<usize> {
        if keep_dims {
            (0..self.shape.len())
                .map(|axis| {
                    if self.reduced.contains(&axis) {
                        1
                    } else {
                        self.shape[axis]
                    }
                })
                .collect()
        } else {
            self.kept.iter().map(|&axis| self.shape[axis]).collect()
        }
    }

    /// Copies `x` into a `(lane_count, lane_length)` matrix, one lane per row.
    pub fn rows(&self, x: &ArrayD<f64>) -> Result<Array2<f64>> {
        if x.shape() != self.shape.as_slice() {
            return Err(GraphError::shape_mismatch(
                "lane layout",
                &self.shape,
                x.shape(),
            ));
        }
        let permuted = x.view().permuted_axes(self.permutation());
        let values = permuted.iter().copied().collect::<Vec<_>>();
        Ok(Array2::from_shape_vec(
            (self.lane_count(), self.lane_length()),
            values,
        )?)
    }

    /// Inverse of `rows`: scatters a `(lane_count, lane_length)` matrix back
    /// into the original shape.
    pub fn restore(&self, rows: &Array2<f64>) -> Result<ArrayD<f64>> {
        let permutation = self.permutation();
        let permuted_shape = permutation
            .iter()
            .map(|&axis| self.shape[axis])
            .collect::<Vec<_>>();
        let permuted =
            ArrayD::from_shape_vec(IxDyn(&permuted_shape), rows.iter().copied().collect())?;
        let restored = permuted.permuted_axes(inverse_permutation(&permutation));
        Ok(standardize(restored.view()))
    }

    pub fn collect(&self, values: Vec<f64>, keep_dims: bool) -> Result<ArrayD<f64>> {
        Ok(ArrayD::from_shape_vec(
            IxDyn(&self.output_shape(keep_dims)),
            values,
        )?)
    }
}

pub fn fold_lanes<F>(x: &ArrayD<f64>, axes: &[usize], keep_dims: bool, fold: F) -> Result<ArrayD<f64>>
where
    F: Fn(ArrayView1<f64>) -> f64,
{
    let layout = LaneLayout::new(x.shape(), axes)?;
    let rows = layout.rows(x)?;
    let values = rows.rows().into_iter().map(fold).collect::<Vec<_>>();
    layout.collect(values, keep_dims)
}

/// Backward counterpart of `fold_lanes`: `lane_gradient` receives a lane,
/// the lane's reduced value and the incoming gradient for that value, and
/// returns the gradient for each element of the lane.
pub fn unfold_lanes<F>(
    x: &ArrayD<f64>,
    axes: &[usize],
    output: &ArrayD<f64>,
    out_gradient: &ArrayD<f64>,
    lane_gradient: F,
) -> Result<ArrayD<f64>>
where
    F: Fn(ArrayView1<f64>, f64, f64) -> Array1<f64>,
{
    let layout = LaneLayout::new(x.shape(), axes)?;
    let rows = layout.rows(x)?;
    let outputs = output.iter().copied().collect::<Vec<_>>();
    let out_gradients = out_gradient.iter().copied().collect::<Vec<_>>();
    if outputs.len() != layout.lane_count() || out_gradients.len() != layout.lane_count() {
        return Err(GraphError::shape_mismatch(
            "reduction gradient",
            &layout.output_shape(false),
            out_gradient.shape(),
        ));
    }
    let mut gradient = Array2::zeros(rows.raw_dim());
    for (i, lane) in rows.rows().into_iter().enumerate() {
        let lane_values = lane_gradient(lane, outputs[i], out_gradients[i]);
        gradient.row_mut(i).assign(&lane_values);
    }
    layout.restore(&gradient)
}

pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut shape = vec![0; rank];
    for i in 0..rank {
        // align from the trailing axis
        let a_dim = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let b_dim = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        shape[i] = match (a_dim, b_dim) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(shape)
}

pub fn broadcast_with<F>(
    operation: &'static str,
    a: &ArrayD<f64>,
    b: &ArrayD<f64>,
    combine: F,
) -> Result<ArrayD<f64>>
where
    F: Fn(f64, f64) -> f64,
{
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(|| {
        GraphError::invalid_argument(
            operation,
            format!(
                "shapes {:?} and {:?} do not broadcast",
                a.shape(),
                b.shape()
            ),
        )
    })?;
    let incompatible = || {
        GraphError::invalid_argument(operation, format!("cannot broadcast to {:?}", shape))
    };
    let a_view = a.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
    let b_view = b.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
    Ok(Zip::from(a_view)
        .and(b_view)
        .map_collect(|&x, &y| combine(x, y)))
}

/// Sums a broadcast gradient back down to `shape`.
pub fn unbroadcast(gradient: ArrayD<f64>, shape: &[usize]) -> ArrayD<f64> {
    let mut gradient = gradient;
    while gradient.ndim() > shape.len() {
        gradient = gradient.sum_axis(Axis(0));
    }
    for (axis, &extent) in shape.iter().enumerate() {
        if extent == 1 && gradient.shape()[axis] != 1 {
            gradient = gradient.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    gradient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_axes() {
        assert_eq!(normalize_axes(&[], 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(normalize_axes(&[2, 0, 2], 3).unwrap(), vec![0, 2]);
        assert!(matches!(
            normalize_axes(&[3], 3),
            Err(GraphError::InvalidAxis { axis: 3, rank: 3 })
        ));
    }

    #[test]
    fn test_resolve_axis() {
        assert_eq!(resolve_axis(-2, 4).unwrap(), 2);
        assert_eq!(resolve_axis(1, 2).unwrap(), 1);
        assert!(resolve_axis(-3, 2).is_err());
    }

    #[test]
    fn test_lane_rows_and_restore() {
        let x = Array::from_shape_fn((2, 3, 4), |(i, j, k)| (100 * i + 10 * j + k) as f64).into_dyn();
        let layout = LaneLayout::new(x.shape(), &[0, 2]).unwrap();
        assert_eq!(layout.lane_count(), 3);
        assert_eq!(layout.lane_length(), 8);
        let rows = layout.rows(&x).unwrap();
        // second lane is j = 1: (i, k) in C order
        assert_eq!(
            rows.row(1).to_vec(),
            vec![10., 11., 12., 13., 110., 111., 112., 113.]
        );
        assert_eq!(layout.restore(&rows).unwrap(), x);
        assert_eq!(layout.output_shape(false), vec![3]);
        assert_eq!(layout.output_shape(true), vec![1, 3, 1]);
    }

    #[test]
    fn test_rows_ignore_memory_order() {
        let c_order = array![[1., 2., 3.], [4., 5., 6.]].into_dyn();
        let f_order = c_order.t().as_standard_layout().into_owned().reversed_axes();
        assert_eq!(c_order, f_order);
        let layout = LaneLayout::new(c_order.shape(), &[1]).unwrap();
        assert_eq!(layout.rows(&c_order).unwrap(), layout.rows(&f_order).unwrap());
    }

    #[test]
    fn test_broadcasting() {
        assert_eq!(broadcast_shape(&[2, 3, 1], &[3, 4]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast_shape(&[2, 3], &[4]), None);
        let a = array![[1., 2.], [3., 4.]].into_dyn();
        let b = array![10., 20.].into_dyn();
        let sum = broadcast_with("add", &a, &b, |x, y| x + y).unwrap();
        assert_eq!(sum, array![[11., 22.], [13., 24.]].into_dyn());
        let gradient = unbroadcast(Array::ones(IxDyn(&[2, 2])), &[2]);
        assert_eq!(gradient, array![2., 2.].into_dyn());
        let gradient = unbroadcast(Array::ones(IxDyn(&[2, 2])), &[2, 1]);
        assert_eq!(gradient, array![[2.], [2.]].into_dyn());
    }
}
