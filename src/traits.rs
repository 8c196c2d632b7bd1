use std::fmt::Debug;
use std::iter::Sum;

use ndarray::NdFloat;

use crate::context::{Context, Mode};
use crate::device::Accelerator;
use crate::layers::LayerType;
use crate::{Blob, Error, Param, Result, Shape};

/// Element type of every blob: `f32` or `f64`.
pub trait Scalar: NdFloat + Sum + Default {
    fn from_f64(v: f64) -> Self;
    fn into_f64(self) -> f64;
}

impl Scalar for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn into_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }

    fn into_f64(self) -> f64 {
        self
    }
}

/// A compute unit that maps `bottom` blobs to `top` blobs and sends gradients
/// back the other way.
///
/// The life of a layer is: `set_up` once per input shape, then any number of
/// `forward`/`backward` rounds. If the input shape changes, call `set_up`
/// again. Parameters survive repeated set-ups.
///
/// Axis 0 of every blob is the mini-batch axis.
pub trait Layer<T: Scalar>: Debug + Send {
    fn name(&self) -> &str;

    fn layer_type(&self) -> LayerType;

    fn exact_num_bottom_blobs(&self) -> usize;

    fn exact_num_top_blobs(&self) -> usize;

    /// Learnable parameters, in a fixed order (for the fully-connected layer:
    /// weight, then bias).
    fn params(&self) -> &[Param<T>];

    fn params_mut(&mut self) -> &mut [Param<T>];

    /// Validate the inputs, create or reuse parameters, size any auxiliary
    /// buffers for the current batch, and return the shape of each top blob.
    fn set_up(&mut self, ctx: &mut Context, bottom: &[Blob<T>]) -> Result<Vec<Shape>>;

    /// `set_up`, then make `top` hold one blob of each returned shape.
    ///
    /// Blobs already in `top` are reshaped, which reallocates them only when
    /// the shape actually changed.
    fn set_up_top(
        &mut self,
        ctx: &mut Context,
        bottom: &[Blob<T>],
        top: &mut Vec<Blob<T>>,
    ) -> Result<()> {
        let shapes = self.set_up(ctx, bottom)?;
        top.truncate(shapes.len());
        for (i, shape) in shapes.into_iter().enumerate() {
            match top.get_mut(i) {
                Some(blob) => blob.reshape(shape),
                None => top.push(Blob::new(shape)),
            }
        }
        Ok(())
    }

    /// Compute `top` from `bottom` on the context's device. Returns this
    /// layer's contribution to the loss (zero unless it is a loss layer).
    fn forward(
        &mut self,
        ctx: &Context,
        bottom: &mut [Blob<T>],
        top: &mut [Blob<T>],
    ) -> Result<T> {
        check_count(self.name(), "bottom", self.exact_num_bottom_blobs(), bottom.len())?;
        check_count(self.name(), "top", self.exact_num_top_blobs(), top.len())?;
        match ctx.mode() {
            Mode::Host => self.forward_host(bottom, top),
            Mode::Accelerator => self.forward_accelerator(ctx.accelerator()?, bottom, top),
        }
    }

    /// Given ∂L/∂top in the top diffs, overwrite each parameter's diff with
    /// ∂L/∂p and, if `propagate_down`, each bottom diff with ∂L/∂bottom.
    ///
    /// Nothing accumulates across calls; callers that want the sum of several
    /// backward passes have to add the diffs up themselves.
    fn backward(
        &mut self,
        ctx: &Context,
        top: &mut [Blob<T>],
        propagate_down: bool,
        bottom: &mut [Blob<T>],
    ) -> Result<()> {
        check_count(self.name(), "bottom", self.exact_num_bottom_blobs(), bottom.len())?;
        check_count(self.name(), "top", self.exact_num_top_blobs(), top.len())?;
        match ctx.mode() {
            Mode::Host => self.backward_host(top, propagate_down, bottom),
            Mode::Accelerator => {
                self.backward_accelerator(ctx.accelerator()?, top, propagate_down, bottom)
            }
        }
    }

    fn forward_host(&mut self, bottom: &mut [Blob<T>], top: &mut [Blob<T>]) -> Result<T>;

    fn forward_accelerator(
        &mut self,
        _accelerator: &Accelerator,
        _bottom: &mut [Blob<T>],
        _top: &mut [Blob<T>],
    ) -> Result<T> {
        Err(Error::UnsupportedMode {
            layer: self.name().to_string(),
            op: "forward",
            mode: Mode::Accelerator,
        })
    }

    fn backward_host(
        &mut self,
        top: &mut [Blob<T>],
        propagate_down: bool,
        bottom: &mut [Blob<T>],
    ) -> Result<()>;

    fn backward_accelerator(
        &mut self,
        _accelerator: &Accelerator,
        _top: &mut [Blob<T>],
        _propagate_down: bool,
        _bottom: &mut [Blob<T>],
    ) -> Result<()> {
        Err(Error::UnsupportedMode {
            layer: self.name().to_string(),
            op: "backward",
            mode: Mode::Accelerator,
        })
    }
}

pub(crate) fn check_count(layer: &str, what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::ShapeMismatch(format!(
            "layer {layer:?} takes {expected} {what} blob(s), got {actual}"
        )))
    }
}
