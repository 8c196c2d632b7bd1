//! Finite-difference check of a layer's `backward` against its `forward`.

use std::fmt;

use log::debug;
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::{Blob, Context, Error, Layer, Result, Scalar};

/// Compares the gradients a layer computes with central differences of the
/// scalar objective
///
/// ```text
///     E = loss + Σ top·r
/// ```
///
/// where `loss` is what `forward` returns and `r` is a fixed random weight for
/// each top element. `∂E/∂top = r`, so `backward` is run with `r` in the top
/// diffs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientChecker {
    /// Half-width `h` of the central difference `(E(v+h) - E(v-h)) / 2h`.
    pub stepsize: f64,
    /// Largest accepted `|analytic - numeric| / max(|analytic|, |numeric|, 1)`.
    pub threshold: f64,
    /// Seed for the top weights `r`.
    pub seed: u64,
}

impl Default for GradientChecker {
    fn default() -> Self {
        GradientChecker {
            stepsize: 1e-2,
            threshold: 1e-2,
            seed: 1701,
        }
    }
}

/// Which blob an element belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobRef {
    Param(usize),
    Bottom(usize),
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobRef::Param(i) => write!(f, "param {i}"),
            BlobRef::Bottom(i) => write!(f, "bottom {i}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub blob: BlobRef,
    pub index: usize,
    pub analytic: f64,
    pub numeric: f64,
}

impl Mismatch {
    pub fn relative_error(&self) -> f64 {
        relative_error(self.analytic, self.numeric)
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} element {}: computed derivative = {}, measured = {}, error = {}",
            self.blob,
            self.index,
            self.analytic,
            self.numeric,
            self.relative_error()
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientReport {
    /// Number of elements compared.
    pub checked: usize,
    pub mismatches: Vec<Mismatch>,
}

impl GradientReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl fmt::Display for GradientReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checked {} elements, {} mismatches",
            self.checked,
            self.mismatches.len()
        )?;
        for m in &self.mismatches {
            write!(f, "\n  {m}")?;
        }
        Ok(())
    }
}

fn relative_error(analytic: f64, numeric: f64) -> f64 {
    let scale = analytic.abs().max(numeric.abs()).max(1.0);
    (analytic - numeric).abs() / scale
}

impl GradientChecker {
    /// Set `layer` up for `bottom`, then check every parameter element and
    /// every element of the bottom blobs listed in `check_bottom`.
    ///
    /// Runs on whatever device `ctx` selects. Bottom and parameter data are
    /// restored afterwards; diffs are left holding the analytic gradients.
    pub fn check<T, L>(
        &self,
        ctx: &mut Context,
        layer: &mut L,
        bottom: &mut Vec<Blob<T>>,
        top: &mut Vec<Blob<T>>,
        check_bottom: &[usize],
    ) -> Result<GradientReport>
    where
        T: Scalar,
        L: Layer<T> + ?Sized,
    {
        if !(self.stepsize > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "gradient check stepsize must be positive, got {}",
                self.stepsize
            )));
        }
        if let Some(&i) = check_bottom.iter().find(|&&i| i >= bottom.len()) {
            return Err(Error::InvalidConfig(format!(
                "can't check bottom {i}: layer {:?} has {} bottom blobs",
                layer.name(),
                bottom.len()
            )));
        }

        layer.set_up_top(ctx, bottom, top)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let weights: Vec<Array1<f64>> = top
            .iter()
            .map(|blob| Array::random_using(blob.count(), Uniform::new(-1.0, 1.0), &mut rng))
            .collect();

        layer.forward(ctx, bottom, top)?;
        for (blob, r) in top.iter_mut().zip(&weights) {
            for (d, &r) in blob.host_diff_mut().iter_mut().zip(r) {
                *d = T::from_f64(r);
            }
        }
        layer.backward(ctx, top, !check_bottom.is_empty(), bottom)?;

        let param_diffs: Vec<Vec<f64>> = layer
            .params_mut()
            .iter_mut()
            .map(|p| p.host_diff().iter().map(|v| v.into_f64()).collect())
            .collect();
        let bottom_diffs: Vec<Vec<f64>> = check_bottom
            .iter()
            .map(|&i| bottom[i].host_diff().iter().map(|v| v.into_f64()).collect())
            .collect();

        let mut report = GradientReport::default();
        let h = T::from_f64(self.stepsize);

        for (i, analytic) in param_diffs.iter().enumerate() {
            for (j, &analytic) in analytic.iter().enumerate() {
                let saved = layer.params_mut()[i].host_data()[j];
                layer.params_mut()[i].host_data_mut()[j] = saved + h;
                let plus = objective(ctx, layer, bottom, top, &weights)?;
                layer.params_mut()[i].host_data_mut()[j] = saved - h;
                let minus = objective(ctx, layer, bottom, top, &weights)?;
                layer.params_mut()[i].host_data_mut()[j] = saved;

                let numeric = (plus - minus) / ((saved + h).into_f64() - (saved - h).into_f64());
                self.compare(&mut report, BlobRef::Param(i), j, analytic, numeric);
            }
        }

        for (&b, analytic) in check_bottom.iter().zip(&bottom_diffs) {
            for (j, &analytic) in analytic.iter().enumerate() {
                let saved = bottom[b].host_data()[j];
                bottom[b].host_data_mut()[j] = saved + h;
                let plus = objective(ctx, layer, bottom, top, &weights)?;
                bottom[b].host_data_mut()[j] = saved - h;
                let minus = objective(ctx, layer, bottom, top, &weights)?;
                bottom[b].host_data_mut()[j] = saved;

                let numeric = (plus - minus) / ((saved + h).into_f64() - (saved - h).into_f64());
                self.compare(&mut report, BlobRef::Bottom(b), j, analytic, numeric);
            }
        }

        debug!("{}: gradient check {report}", layer.name());
        Ok(report)
    }

    fn compare(
        &self,
        report: &mut GradientReport,
        blob: BlobRef,
        index: usize,
        analytic: f64,
        numeric: f64,
    ) {
        report.checked += 1;
        if !(relative_error(analytic, numeric) <= self.threshold) {
            report.mismatches.push(Mismatch {
                blob,
                index,
                analytic,
                numeric,
            });
        }
    }
}

fn objective<T, L>(
    ctx: &Context,
    layer: &mut L,
    bottom: &mut [Blob<T>],
    top: &mut [Blob<T>],
    weights: &[Array1<f64>],
) -> Result<f64>
where
    T: Scalar,
    L: Layer<T> + ?Sized,
{
    let mut total = layer.forward(ctx, bottom, top)?.into_f64();
    for (blob, r) in top.iter_mut().zip(weights) {
        total += blob
            .host_data()
            .iter()
            .zip(r)
            .map(|(v, r)| v.into_f64() * r)
            .sum::<f64>();
    }
    Ok(total)
}
