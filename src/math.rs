//! Dense linear algebra, once for each device.
//!
//! Everything works on flat row-major slices, BLAS style: a matrix is a slice
//! plus its row and column counts, and a vector is a slice plus an element
//! stride.

use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::parallel::prelude::*;
use ndarray::prelude::*;
use ndarray::{ShapeBuilder, Zip};

use crate::device::Accelerator;
use crate::memory::SyncedMemory;
use crate::{Error, Result, Scalar};

/// Whether a matrix operand is used as stored or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    No,
    Yes,
}

/// The primitives layers are written against.
///
/// `read` and `write` hand out the device-side copy of a `SyncedMemory`,
/// syncing it first if needed. The other methods take slices obtained that
/// way.
pub trait Backend<T: Scalar> {
    fn read<'a>(&self, mem: &'a mut SyncedMemory<T>) -> &'a [T];

    fn write<'a>(&self, mem: &'a mut SyncedMemory<T>) -> &'a mut [T];

    /// `C = alpha·op(A)·op(B) + beta·C`, where `op(A)` is `m×k`, `op(B)` is
    /// `k×n` and `C` is `m×n`.
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        &self,
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: T,
        a: &[T],
        b: &[T],
        beta: T,
        c: &mut [T],
    ) -> Result<()>;

    /// `y = alpha·op(A)·x + beta·y`, where `A` is stored `m×n`.
    #[allow(clippy::too_many_arguments)]
    fn gemv(
        &self,
        trans_a: Transpose,
        m: usize,
        n: usize,
        alpha: T,
        a: &[T],
        x: &[T],
        beta: T,
        y: &mut [T],
    ) -> Result<()>;

    /// Euclidean norm of `x[0], x[incx], ..., x[(n-1)·incx]`.
    fn norm2(&self, n: usize, x: &[T], incx: usize) -> Result<T>;

    /// Multiply `x[0], x[incx], ..., x[(n-1)·incx]` by `alpha` in place.
    fn scal(&self, n: usize, alpha: T, x: &mut [T], incx: usize) -> Result<()>;
}

/// The host CPU, running on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Host;

fn sized<'a, T>(what: &str, data: &'a [T], len: usize) -> Result<&'a [T]> {
    data.get(..len).ok_or_else(|| {
        Error::ShapeMismatch(format!(
            "{what} needs {len} elements, buffer has {}",
            data.len()
        ))
    })
}

fn sized_mut<'a, T>(what: &str, data: &'a mut [T], len: usize) -> Result<&'a mut [T]> {
    let available = data.len();
    data.get_mut(..len).ok_or_else(|| {
        Error::ShapeMismatch(format!(
            "{what} needs {len} elements, buffer has {available}"
        ))
    })
}

/// View `data` as the `rows×cols` matrix `op(M)`.
fn matrix<'a, T>(
    what: &str,
    trans: Transpose,
    rows: usize,
    cols: usize,
    data: &'a [T],
) -> Result<ArrayView2<'a, T>> {
    let data = sized(what, data, rows * cols)?;
    Ok(match trans {
        Transpose::No => ArrayView2::from_shape((rows, cols), data)?,
        Transpose::Yes => ArrayView2::from_shape((cols, rows), data)?.reversed_axes(),
    })
}

fn strided_len(n: usize, inc: usize) -> Result<usize> {
    if inc == 0 {
        return Err(Error::ShapeMismatch("vector stride must be positive".to_string()));
    }
    Ok(if n == 0 { 0 } else { (n - 1) * inc + 1 })
}

fn strided<T>(n: usize, x: &[T], inc: usize) -> Result<ArrayView1<'_, T>> {
    let x = sized("strided vector", x, strided_len(n, inc)?)?;
    Ok(ArrayView1::from_shape(Ix1(n).strides(Ix1(inc)), x)?)
}

fn strided_mut<T>(n: usize, x: &mut [T], inc: usize) -> Result<ArrayViewMut1<'_, T>> {
    let x = sized_mut("strided vector", x, strided_len(n, inc)?)?;
    Ok(ArrayViewMut1::from_shape(Ix1(n).strides(Ix1(inc)), x)?)
}

impl<T: Scalar> Backend<T> for Host {
    fn read<'a>(&self, mem: &'a mut SyncedMemory<T>) -> &'a [T] {
        mem.host()
    }

    fn write<'a>(&self, mem: &'a mut SyncedMemory<T>) -> &'a mut [T] {
        mem.host_mut()
    }

    fn gemm(
        &self,
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: T,
        a: &[T],
        b: &[T],
        beta: T,
        c: &mut [T],
    ) -> Result<()> {
        let a = matrix("gemm operand A", trans_a, m, k, a)?;
        let b = matrix("gemm operand B", trans_b, k, n, b)?;
        let mut c = ArrayViewMut2::from_shape((m, n), sized_mut("gemm output", c, m * n)?)?;
        general_mat_mul(alpha, &a, &b, beta, &mut c);
        Ok(())
    }

    fn gemv(
        &self,
        trans_a: Transpose,
        m: usize,
        n: usize,
        alpha: T,
        a: &[T],
        x: &[T],
        beta: T,
        y: &mut [T],
    ) -> Result<()> {
        let (rows, cols) = match trans_a {
            Transpose::No => (m, n),
            Transpose::Yes => (n, m),
        };
        let a = matrix("gemv matrix", trans_a, rows, cols, a)?;
        let x = ArrayView1::from_shape(cols, sized("gemv input", x, cols)?)?;
        let mut y = ArrayViewMut1::from_shape(rows, sized_mut("gemv output", y, rows)?)?;
        general_mat_vec_mul(alpha, &a, &x, beta, &mut y);
        Ok(())
    }

    fn norm2(&self, n: usize, x: &[T], incx: usize) -> Result<T> {
        let x = strided(n, x, incx)?;
        Ok(x.iter().map(|&v| v * v).sum::<T>().sqrt())
    }

    fn scal(&self, n: usize, alpha: T, x: &mut [T], incx: usize) -> Result<()> {
        let mut x = strided_mut(n, x, incx)?;
        x.mapv_inplace(|v| v * alpha);
        Ok(())
    }
}

/// Accelerator kernels: the same operations, split across the accelerator's
/// workers one output row at a time.
impl<T: Scalar> Backend<T> for Accelerator {
    fn read<'a>(&self, mem: &'a mut SyncedMemory<T>) -> &'a [T] {
        mem.device(self)
    }

    fn write<'a>(&self, mem: &'a mut SyncedMemory<T>) -> &'a mut [T] {
        mem.device_mut(self)
    }

    fn gemm(
        &self,
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: T,
        a: &[T],
        b: &[T],
        beta: T,
        c: &mut [T],
    ) -> Result<()> {
        let a = matrix("gemm operand A", trans_a, m, k, a)?;
        let b = matrix("gemm operand B", trans_b, k, n, b)?;
        let mut c = ArrayViewMut2::from_shape((m, n), sized_mut("gemm output", c, m * n)?)?;
        let bt = b.t();
        self.run(|| {
            Zip::from(c.rows_mut())
                .and(a.rows())
                .par_for_each(|mut c_row, a_row| {
                    general_mat_vec_mul(alpha, &bt, &a_row, beta, &mut c_row);
                });
        });
        Ok(())
    }

    fn gemv(
        &self,
        trans_a: Transpose,
        m: usize,
        n: usize,
        alpha: T,
        a: &[T],
        x: &[T],
        beta: T,
        y: &mut [T],
    ) -> Result<()> {
        let (rows, cols) = match trans_a {
            Transpose::No => (m, n),
            Transpose::Yes => (n, m),
        };
        let a = matrix("gemv matrix", trans_a, rows, cols, a)?;
        let x = ArrayView1::from_shape(cols, sized("gemv input", x, cols)?)?;
        let mut y = ArrayViewMut1::from_shape(rows, sized_mut("gemv output", y, rows)?)?;
        self.run(|| {
            Zip::from(&mut y).and(a.rows()).par_for_each(|y, row| {
                let ax = alpha * row.dot(&x);
                // beta == 0 means y is write-only, even if it holds NaN.
                *y = if beta == T::zero() { ax } else { ax + beta * *y };
            });
        });
        Ok(())
    }

    fn norm2(&self, n: usize, x: &[T], incx: usize) -> Result<T> {
        let x = strided(n, x, incx)?;
        let sum_sq = self.run(|| x.into_par_iter().map(|&v| v * v).sum::<T>());
        Ok(sum_sq.sqrt())
    }

    fn scal(&self, n: usize, alpha: T, x: &mut [T], incx: usize) -> Result<()> {
        let mut x = strided_mut(n, x, incx)?;
        self.run(|| x.par_mapv_inplace(|v| v * alpha));
        Ok(())
    }
}
