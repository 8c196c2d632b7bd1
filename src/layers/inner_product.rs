use log::info;
use serde::{Deserialize, Serialize};

use crate::device::Accelerator;
use crate::layers::LayerType;
use crate::math::{Backend, Host, Transpose};
use crate::memory::SyncedMemory;
use crate::traits::check_count;
use crate::{Blob, Context, Error, FillerConfig, Layer, Mode, Param, Result, Scalar, Shape};

/// Added to a column norm before dividing by it.
pub const NORM_EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerProductConfig {
    /// Number of outputs per example.
    pub num_output: usize,
    #[serde(default = "default_bias_term")]
    pub bias_term: bool,
    #[serde(default)]
    pub weight_filler: FillerConfig,
    #[serde(default)]
    pub bias_filler: FillerConfig,
}

fn default_bias_term() -> bool {
    true
}

impl Default for InnerProductConfig {
    fn default() -> Self {
        InnerProductConfig {
            num_output: 0,
            bias_term: default_bias_term(),
            weight_filler: FillerConfig::default(),
            bias_filler: FillerConfig::default(),
        }
    }
}

/// Sizes fixed by the last `set_up`.
#[derive(Debug, Clone, Copy)]
struct Dims {
    /// Examples per batch.
    m: usize,
    /// Inputs per example (everything but axis 0, flattened).
    k: usize,
    /// Outputs per example.
    n: usize,
}

/// A dense layer: `y = x·Wᵀ + b`.
///
/// Input shape is `(M, ...)`, flattened to `M×K`. Output shape is
/// `(M, N, 1, 1)`. The weight blob is `(1, 1, N, K)`, so each row of `W`
/// holds the incoming weights of one output; the optional bias is
/// `(1, 1, 1, N)`.
#[derive(Debug)]
pub struct InnerProductLayer<T> {
    name: String,
    config: InnerProductConfig,
    /// `[weight]` or `[weight, bias]`; empty until the first `set_up`.
    params: Vec<Param<T>>,
    /// `M` ones. Multiplying by this broadcasts the bias over the batch (in
    /// `forward`) and sums over the batch (in `backward`).
    bias_multiplier: Option<SyncedMemory<T>>,
    dims: Option<Dims>,
}

impl<T: Scalar> InnerProductLayer<T> {
    pub fn new(name: impl Into<String>, config: InnerProductConfig) -> Result<Self> {
        if config.num_output == 0 {
            return Err(Error::InvalidConfig(
                "inner product layer needs num_output > 0".to_string(),
            ));
        }
        config.weight_filler.validate()?;
        if config.bias_term {
            config.bias_filler.validate()?;
        }
        Ok(InnerProductLayer {
            name: name.into(),
            config,
            params: vec![],
            bias_multiplier: None,
            dims: None,
        })
    }

    /// A layer whose parameters were produced elsewhere, e.g. restored from
    /// a checkpoint. `set_up` keeps them instead of running the fillers, and
    /// fails if their shapes don't fit the input.
    pub fn with_params(
        name: impl Into<String>,
        config: InnerProductConfig,
        params: Vec<Param<T>>,
    ) -> Result<Self> {
        let mut layer = Self::new(name, config)?;
        layer.params = params;
        Ok(layer)
    }

    pub fn config(&self) -> &InnerProductConfig {
        &self.config
    }

    pub fn weight(&self) -> Option<&Param<T>> {
        self.params.first()
    }

    pub fn bias(&self) -> Option<&Param<T>> {
        self.params.get(1)
    }

    /// Rescale every weight column whose L2 norm exceeds `max_norm` so that
    /// its norm becomes `max_norm`. Other columns are left alone.
    ///
    /// A column here is the strided vector `W[0][i], W[1][i], ...`: one
    /// element per output, for input `i`.
    pub fn normalize_weights(&mut self, ctx: &Context, max_norm: T) -> Result<()> {
        let eps = T::from_f64(NORM_EPSILON);
        self.rescale_columns(ctx, |norm| {
            (norm > max_norm).then(|| max_norm / (norm + eps))
        })
    }

    /// Rescale every weight column whose L2 norm is outside
    /// `[min_norm, max_norm]` so that its norm becomes `target_norm`.
    pub fn normalize_weights_range(
        &mut self,
        ctx: &Context,
        min_norm: T,
        max_norm: T,
        target_norm: T,
    ) -> Result<()> {
        let eps = T::from_f64(NORM_EPSILON);
        self.rescale_columns(ctx, |norm| {
            (norm < min_norm || norm > max_norm).then(|| target_norm / (norm + eps))
        })
    }

    fn rescale_columns<F>(&mut self, ctx: &Context, factor: F) -> Result<()>
    where
        F: Fn(T) -> Option<T>,
    {
        match ctx.mode() {
            Mode::Host => self.rescale_columns_on(&Host, factor),
            Mode::Accelerator => self.rescale_columns_on(ctx.accelerator()?, factor),
        }
    }

    fn rescale_columns_on<B, F>(&mut self, dev: &B, factor: F) -> Result<()>
    where
        B: Backend<T>,
        F: Fn(T) -> Option<T>,
    {
        let name = &self.name;
        let weight = self.params.first_mut().ok_or_else(|| {
            Error::ShapeMismatch(format!("layer {name:?} has no weights yet; call set_up first"))
        })?;
        let Shape { height, width, .. } = weight.shape();
        let w = dev.write(weight.data());
        for i in 0..width {
            let column = &mut w[i..];
            let norm = dev.norm2(height, column, width)?;
            if let Some(scale) = factor(norm) {
                dev.scal(height, scale, column, width)?;
            }
        }
        Ok(())
    }

    /// The dimensions from `set_up`, after checking that the blobs still
    /// match them.
    fn dims(&self, bottom: &[Blob<T>], top: &[Blob<T>]) -> Result<Dims> {
        let dims = self.dims.ok_or_else(|| {
            Error::ShapeMismatch(format!("layer {:?} used before set_up", self.name))
        })?;
        check_count(&self.name, "bottom", 1, bottom.len())?;
        check_count(&self.name, "top", 1, top.len())?;
        let input = bottom[0].shape();
        if input.num != dims.m || input.count() != dims.m * dims.k {
            return Err(Error::ShapeMismatch(format!(
                "layer {:?} was set up for {} examples of {} inputs, got input of shape {input}; \
                 call set_up again after changing shapes",
                self.name, dims.m, dims.k
            )));
        }
        let output = top[0].shape();
        if output.count() != dims.m * dims.n {
            return Err(Error::ShapeMismatch(format!(
                "layer {:?} produces {}x{} outputs, top blob has shape {output}",
                self.name, dims.m, dims.n
            )));
        }
        Ok(dims)
    }

    fn forward_on<B: Backend<T>>(
        &mut self,
        dev: &B,
        bottom: &mut [Blob<T>],
        top: &mut [Blob<T>],
    ) -> Result<T> {
        let Dims { m, k, n } = self.dims(bottom, top)?;
        let one = T::one();
        let zero = T::zero();

        let (weight, bias) = split_params(&self.name, &mut self.params)?;
        let x = dev.read(bottom[0].data());
        let w = dev.read(weight.data());
        let y = dev.write(top[0].data());
        dev.gemm(Transpose::No, Transpose::Yes, m, n, k, one, x, w, zero, y)?;
        if let (Some(bias), Some(multiplier)) = (bias, self.bias_multiplier.as_mut()) {
            let ones = dev.read(multiplier);
            let b = dev.read(bias.data());
            dev.gemm(Transpose::No, Transpose::No, m, n, 1, one, ones, b, one, y)?;
        }
        Ok(zero)
    }

    fn backward_on<B: Backend<T>>(
        &mut self,
        dev: &B,
        top: &mut [Blob<T>],
        propagate_down: bool,
        bottom: &mut [Blob<T>],
    ) -> Result<()> {
        let Dims { m, k, n } = self.dims(bottom, top)?;
        let one = T::one();
        let zero = T::zero();

        let (weight, bias) = split_params(&self.name, &mut self.params)?;
        let dy = dev.read(top[0].diff());
        let (bottom_data, bottom_diff) = bottom[0].data_and_diff();
        let (weight_data, weight_diff) = weight.data_and_diff();

        // ∂L/∂W = dyᵀ·x, N×K
        let x = dev.read(bottom_data);
        let dw = dev.write(weight_diff);
        dev.gemm(Transpose::Yes, Transpose::No, n, k, m, one, dy, x, zero, dw)?;

        // ∂L/∂b = dyᵀ·1, summing over the batch
        if let (Some(bias), Some(multiplier)) = (bias, self.bias_multiplier.as_mut()) {
            let ones = dev.read(multiplier);
            let db = dev.write(bias.diff());
            dev.gemv(Transpose::Yes, m, n, one, dy, ones, zero, db)?;
        }

        // ∂L/∂x = dy·W, M×K
        if propagate_down {
            let w = dev.read(weight_data);
            let dx = dev.write(bottom_diff);
            dev.gemm(Transpose::No, Transpose::No, m, k, n, one, dy, w, zero, dx)?;
        }
        Ok(())
    }
}

fn split_params<'a, T>(
    name: &str,
    params: &'a mut [Param<T>],
) -> Result<(&'a mut Param<T>, Option<&'a mut Param<T>>)> {
    match params {
        [weight] => Ok((weight, None)),
        [weight, bias] => Ok((weight, Some(bias))),
        params => Err(Error::ShapeMismatch(format!(
            "layer {name:?} has {} parameter blobs",
            params.len()
        ))),
    }
}

impl<T: Scalar> Layer<T> for InnerProductLayer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> LayerType {
        LayerType::InnerProduct
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        1
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn params(&self) -> &[Param<T>] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param<T>] {
        &mut self.params
    }

    fn set_up(&mut self, ctx: &mut Context, bottom: &[Blob<T>]) -> Result<Vec<Shape>> {
        check_count(&self.name, "bottom", 1, bottom.len())?;
        let input = bottom[0].shape();
        let m = input.num;
        let k = input.sample_count();
        let n = self.config.num_output;
        if m == 0 || k == 0 {
            return Err(Error::ShapeMismatch(format!(
                "layer {:?} got empty input of shape {input}",
                self.name
            )));
        }

        let weight_shape = Shape::new(1, 1, n, k);
        let bias_shape = Shape::new(1, 1, 1, n);
        if self.params.is_empty() {
            let mut weight = Param::new(format!("{}.weight", self.name), weight_shape);
            weight.fill(&self.config.weight_filler, ctx.rng())?;
            self.params.push(weight);
            if self.config.bias_term {
                let mut bias = Param::new(format!("{}.bias", self.name), bias_shape);
                bias.fill(&self.config.bias_filler, ctx.rng())?;
                self.params.push(bias);
            }
        } else {
            info!("{}: skipping parameter initialization", self.name);
            let mut expected = vec![weight_shape];
            if self.config.bias_term {
                expected.push(bias_shape);
            }
            let actual: Vec<Shape> = self.params.iter().map(|p| p.shape()).collect();
            if actual != expected {
                return Err(Error::ShapeMismatch(format!(
                    "layer {:?} has parameters of shape {actual:?}, but input of shape {input} \
                     needs {expected:?}",
                    self.name
                )));
            }
        }

        self.bias_multiplier = self
            .config
            .bias_term
            .then(|| SyncedMemory::from_vec(vec![T::one(); m]));
        self.dims = Some(Dims { m, k, n });
        Ok(vec![Shape::new(m, n, 1, 1)])
    }

    fn forward_host(&mut self, bottom: &mut [Blob<T>], top: &mut [Blob<T>]) -> Result<T> {
        self.forward_on(&Host, bottom, top)
    }

    fn forward_accelerator(
        &mut self,
        accelerator: &Accelerator,
        bottom: &mut [Blob<T>],
        top: &mut [Blob<T>],
    ) -> Result<T> {
        self.forward_on(accelerator, bottom, top)
    }

    fn backward_host(
        &mut self,
        top: &mut [Blob<T>],
        propagate_down: bool,
        bottom: &mut [Blob<T>],
    ) -> Result<()> {
        self.backward_on(&Host, top, propagate_down, bottom)
    }

    fn backward_accelerator(
        &mut self,
        accelerator: &Accelerator,
        top: &mut [Blob<T>],
        propagate_down: bool,
        bottom: &mut [Blob<T>],
    ) -> Result<()> {
        self.backward_on(accelerator, top, propagate_down, bottom)
    }
}
