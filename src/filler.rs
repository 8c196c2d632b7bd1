//! Initial values for parameter blobs.

use ndarray::prelude::*;
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Blob, Error, Result, Scalar};

/// How to fill a blob's data.
///
/// Values are drawn in `f64` and then converted to the blob's element type,
/// so the same seed gives the same numbers for `f32` and `f64` blobs (up to
/// rounding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FillerConfig {
    Constant {
        #[serde(default)]
        value: f64,
    },
    Uniform {
        min: f64,
        max: f64,
    },
    Gaussian {
        #[serde(default)]
        mean: f64,
        std: f64,
    },
    /// Uniform in `[-s, s]` with `s = sqrt(3 / fan_in)`, where `fan_in` is the
    /// number of elements per example (`count / num`).
    Xavier,
}

impl Default for FillerConfig {
    fn default() -> Self {
        FillerConfig::Constant { value: 0.0 }
    }
}

impl FillerConfig {
    /// Check the parameters without filling anything.
    pub fn validate(&self) -> Result<()> {
        match *self {
            FillerConfig::Constant { .. } | FillerConfig::Xavier => Ok(()),
            FillerConfig::Uniform { min, max } => {
                if min < max {
                    Ok(())
                } else {
                    Err(Error::InvalidConfig(format!(
                        "uniform filler needs min < max, got [{min}, {max}]"
                    )))
                }
            }
            FillerConfig::Gaussian { std, .. } => {
                if std >= 0.0 && std.is_finite() {
                    Ok(())
                } else {
                    Err(Error::InvalidConfig(format!(
                        "gaussian filler needs a finite std >= 0, got {std}"
                    )))
                }
            }
        }
    }

    pub fn fill<T, R>(&self, blob: &mut Blob<T>, rng: &mut R) -> Result<()>
    where
        T: Scalar,
        R: Rng + ?Sized,
    {
        self.validate()?;
        let n = blob.count();
        let values: Array1<f64> = match *self {
            FillerConfig::Constant { value } => Array::from_elem(n, value),
            FillerConfig::Uniform { min, max } => {
                Array::random_using(n, Uniform::new(min, max), rng)
            }
            FillerConfig::Gaussian { mean, std } => {
                let normal = Normal::new(mean, std)
                    .map_err(|err| Error::InvalidConfig(format!("gaussian filler: {err}")))?;
                Array::random_using(n, normal, rng)
            }
            FillerConfig::Xavier => {
                let fan_in = blob.shape().sample_count().max(1);
                let scale = (3.0 / fan_in as f64).sqrt();
                Array::random_using(n, Uniform::new_inclusive(-scale, scale), rng)
            }
        };
        for (dst, v) in blob.host_data_mut().iter_mut().zip(values) {
            *dst = T::from_f64(v);
        }
        Ok(())
    }
}
