use std::fmt;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::memory::SyncedMemory;
use crate::{Context, Result, Scalar};

/// Shape of a blob: `(num, channels, height, width)`.
///
/// `num` is the mini-batch axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub num: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub fn new(num: usize, channels: usize, height: usize, width: usize) -> Self {
        Shape {
            num,
            channels,
            height,
            width,
        }
    }

    pub fn count(&self) -> usize {
        self.num * self.channels * self.height * self.width
    }

    /// Number of elements per example, i.e. `count() / num`.
    pub fn sample_count(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Index of element `(n, c, h, w)` in the flat row-major storage.
    pub fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        ((n * self.channels + c) * self.height + h) * self.width + w
    }

    pub fn as_ix4(&self) -> Ix4 {
        Ix4(self.num, self.channels, self.height, self.width)
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((num, channels, height, width): (usize, usize, usize, usize)) -> Self {
        Shape::new(num, channels, height, width)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.num, self.channels, self.height, self.width
        )
    }
}

/// A 4-D array of values (`data`) together with an array of gradients of the
/// same shape (`diff`). Both start out as zeros.
///
/// The shape is fixed for the life of the storage. `reshape` to a different
/// shape throws the old storage away.
pub struct Blob<T> {
    shape: Shape,
    data: SyncedMemory<T>,
    diff: SyncedMemory<T>,
}

impl<T: Scalar> Blob<T> {
    pub fn new(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Blob {
            shape,
            data: SyncedMemory::new(shape.count()),
            diff: SyncedMemory::new(shape.count()),
        }
    }

    /// A blob whose data is a copy of `array`.
    pub fn from_array(array: ArrayView4<'_, T>) -> Self {
        let (n, c, h, w) = array.dim();
        Blob {
            shape: Shape::new(n, c, h, w),
            data: SyncedMemory::from_vec(array.iter().copied().collect()),
            diff: SyncedMemory::new(array.len()),
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn num(&self) -> usize {
        self.shape.num
    }

    pub fn count(&self) -> usize {
        self.shape.count()
    }

    /// Reallocate for a new shape. Does nothing if the shape is unchanged;
    /// otherwise data and diff are both reset to zeros.
    pub fn reshape(&mut self, shape: impl Into<Shape>) {
        let shape = shape.into();
        if shape != self.shape {
            *self = Blob::new(shape);
        }
    }

    pub fn data(&mut self) -> &mut SyncedMemory<T> {
        &mut self.data
    }

    pub fn diff(&mut self) -> &mut SyncedMemory<T> {
        &mut self.diff
    }

    /// Both arrays at once, for kernels that read one and write the other.
    pub fn data_and_diff(&mut self) -> (&mut SyncedMemory<T>, &mut SyncedMemory<T>) {
        (&mut self.data, &mut self.diff)
    }

    pub fn host_data(&mut self) -> &[T] {
        self.data.host()
    }

    pub fn host_data_mut(&mut self) -> &mut [T] {
        self.data.host_mut()
    }

    pub fn host_diff(&mut self) -> &[T] {
        self.diff.host()
    }

    pub fn host_diff_mut(&mut self) -> &mut [T] {
        self.diff.host_mut()
    }

    pub fn device_data(&mut self, ctx: &Context) -> Result<&[T]> {
        Ok(self.data.device(ctx.accelerator()?))
    }

    pub fn device_data_mut(&mut self, ctx: &Context) -> Result<&mut [T]> {
        Ok(self.data.device_mut(ctx.accelerator()?))
    }

    pub fn device_diff(&mut self, ctx: &Context) -> Result<&[T]> {
        Ok(self.diff.device(ctx.accelerator()?))
    }

    pub fn device_diff_mut(&mut self, ctx: &Context) -> Result<&mut [T]> {
        Ok(self.diff.device_mut(ctx.accelerator()?))
    }

    /// Copy of the data, as an array of this blob's shape.
    pub fn data_array(&mut self) -> Array4<T> {
        let shape = self.shape.as_ix4();
        Array::from_shape_vec(shape, self.data.host().to_vec())
            .expect("storage length always matches the shape")
    }

    /// Copy of the diff, as an array of this blob's shape.
    pub fn diff_array(&mut self) -> Array4<T> {
        let shape = self.shape.as_ix4();
        Array::from_shape_vec(shape, self.diff.host().to_vec())
            .expect("storage length always matches the shape")
    }

    pub fn fill_data(&mut self, value: T) {
        self.data.host_mut().fill(value);
    }

    pub fn fill_diff(&mut self, value: T) {
        self.diff.host_mut().fill(value);
    }

    /// Copy `other`'s data into this blob. The element counts must agree.
    pub fn copy_data_from(&mut self, other: &mut Blob<T>) -> Result<()> {
        if other.count() != self.count() {
            return Err(crate::Error::ShapeMismatch(format!(
                "can't copy blob of shape {} into blob of shape {}",
                other.shape, self.shape
            )));
        }
        self.data.host_mut().copy_from_slice(other.data.host());
        Ok(())
    }
}

impl<T> fmt::Debug for Blob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob").field("shape", &self.shape).finish()
    }
}
