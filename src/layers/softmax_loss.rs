use ndarray::prelude::*;
use ndarray::Zip;

use crate::layers::LayerType;
use crate::traits::check_count;
use crate::{Blob, Context, Error, Layer, Param, Result, Scalar, Shape};

/// Loss layer comparing a softmax over each example's scores with a target
/// distribution over the same classes.
///
/// Bottom blobs are the scores `x`, shape `(M, C, ...)`, and the label weights
/// `l`, with the same number of elements. There is no top blob; `forward`
/// returns the loss
///
/// ```text
///     (1/M) Σᵢ Σⱼ l[i,j] · (ln l[i,j] - ln softmax(x[i])[j])
/// ```
///
/// where `l·ln l` counts only for `l > 0`. Subtracting the entropy of `l`
/// makes the minimum 0; when each row of `l` sums to 1 this is the KL
/// divergence from the prediction to the labels. Only the scores get a
/// gradient.
///
/// Host only.
#[derive(Debug)]
pub struct SoftmaxMultilabelLossLayer<T> {
    name: String,
    /// Softmax of the scores from the last `forward`, `M×C`.
    prob: Option<Array2<T>>,
}

impl<T: Scalar> SoftmaxMultilabelLossLayer<T> {
    pub fn new(name: impl Into<String>) -> Self {
        SoftmaxMultilabelLossLayer {
            name: name.into(),
            prob: None,
        }
    }

    /// `(M, C)`, checked against both bottom blobs.
    fn dims(&self, bottom: &[Blob<T>]) -> Result<(usize, usize)> {
        check_count(&self.name, "bottom", 2, bottom.len())?;
        let scores = bottom[0].shape();
        let labels = bottom[1].shape();
        if scores.num == 0 || scores.sample_count() == 0 {
            return Err(Error::ShapeMismatch(format!(
                "layer {:?} got empty scores of shape {scores}",
                self.name
            )));
        }
        if labels.count() != scores.count() {
            return Err(Error::ShapeMismatch(format!(
                "layer {:?}: labels of shape {labels} don't match scores of shape {scores}",
                self.name
            )));
        }
        Ok((scores.num, scores.sample_count()))
    }
}

fn split_bottom<'a, T>(bottom: &'a mut [Blob<T>]) -> Option<(&'a mut Blob<T>, &'a mut Blob<T>)> {
    match bottom {
        [scores, labels] => Some((scores, labels)),
        _ => None,
    }
}

impl<T: Scalar> Layer<T> for SoftmaxMultilabelLossLayer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> LayerType {
        LayerType::SoftmaxMultilabelLoss
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        2
    }

    fn exact_num_top_blobs(&self) -> usize {
        0
    }

    fn params(&self) -> &[Param<T>] {
        &[]
    }

    fn params_mut(&mut self) -> &mut [Param<T>] {
        &mut []
    }

    fn set_up(&mut self, _ctx: &mut Context, bottom: &[Blob<T>]) -> Result<Vec<Shape>> {
        self.dims(bottom)?;
        self.prob = None;
        Ok(vec![])
    }

    fn forward_host(&mut self, bottom: &mut [Blob<T>], _top: &mut [Blob<T>]) -> Result<T> {
        let (m, c) = self.dims(bottom)?;
        let Some((scores, labels)) = split_bottom(bottom) else {
            unreachable!("dims() checked the bottom count");
        };
        let x = ArrayView2::from_shape((m, c), scores.host_data())?;
        let l = ArrayView2::from_shape((m, c), labels.host_data())?;

        // ln softmax(x), computed after subtracting each row's max so exp()
        // can't overflow.
        let max = x.fold_axis(Axis(1), T::neg_infinity(), |&a, &b| a.max(b));
        let shifted = &x - &max.slice(s![.., NewAxis]);
        let log_sum_ex = shifted.mapv(|v| v.exp()).sum_axis(Axis(1)).mapv(|s| s.ln());
        let log_prob = &shifted - &log_sum_ex.slice(s![.., NewAxis]);

        // The entropy term l·ln l is constant in x; only l > 0 contributes.
        let mut total = T::zero();
        Zip::from(&l).and(&log_prob).for_each(|&l, &lp| {
            total -= l * lp;
            if l > T::zero() {
                total += l * l.ln();
            }
        });
        self.prob = Some(log_prob.mapv(|v| v.exp()));
        Ok(total / T::from_f64(m as f64))
    }

    fn backward_host(
        &mut self,
        _top: &mut [Blob<T>],
        propagate_down: bool,
        bottom: &mut [Blob<T>],
    ) -> Result<()> {
        if !propagate_down {
            return Ok(());
        }
        let (m, c) = self.dims(bottom)?;
        let prob = self
            .prob
            .as_ref()
            .filter(|prob| prob.dim() == (m, c))
            .ok_or_else(|| {
                Error::ShapeMismatch(format!(
                    "layer {:?}: backward needs a forward pass with the same shapes first",
                    self.name
                ))
            })?;
        let Some((scores, labels)) = split_bottom(bottom) else {
            unreachable!("dims() checked the bottom count");
        };
        let l = ArrayView2::from_shape((m, c), labels.host_data())?;
        let mut dx = ArrayViewMut2::from_shape((m, c), scores.host_diff_mut())?;

        // ∂/∂x[i,j] of -Σₖ l[i,k]·ln p[i,k] is p[i,j]·Σₖ l[i,k] - l[i,j].
        let label_sum = l.sum_axis(Axis(1));
        let scale = T::one() / T::from_f64(m as f64);
        dx.assign(&((prob * &label_sum.slice(s![.., NewAxis]) - &l) * scale));
        Ok(())
    }
}
