use std::ops::{Deref, DerefMut};

use rand::Rng;

use crate::{Blob, FillerConfig, Result, Scalar, Shape};

/// A learnable parameter: a named blob whose `diff` receives ∂L/∂p.
///
/// Owned by exactly one layer.
#[derive(Debug)]
pub struct Param<T> {
    name: String,
    blob: Blob<T>,
}

impl<T: Scalar> Param<T> {
    pub fn new(name: impl Into<String>, shape: impl Into<Shape>) -> Self {
        Param {
            name: name.into(),
            blob: Blob::new(shape),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fill<R: Rng + ?Sized>(&mut self, filler: &FillerConfig, rng: &mut R) -> Result<()> {
        filler.fill(&mut self.blob, rng)
    }
}

impl<T> Deref for Param<T> {
    type Target = Blob<T>;

    fn deref(&self) -> &Blob<T> {
        &self.blob
    }
}

impl<T> DerefMut for Param<T> {
    fn deref_mut(&mut self) -> &mut Blob<T> {
        &mut self.blob
    }
}
