use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::device::Accelerator;
use crate::{Error, Result};

/// Where layer computations run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Host,
    Accelerator,
}

/// Everything a layer call needs to know about its surroundings: which device
/// to run on, the accelerator (if any), and the random number generator that
/// fillers draw from.
///
/// Pass it to every `set_up`, `forward` and `backward`. Two contexts never
/// share state, so they can be used from different threads at once.
#[derive(Debug)]
pub struct Context {
    mode: Mode,
    accelerator: Option<Arc<Accelerator>>,
    rng: StdRng,
}

impl Context {
    /// A host-only context seeded from the OS.
    pub fn host() -> Self {
        Context {
            mode: Mode::Host,
            accelerator: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// A context that runs on `accelerator`.
    pub fn with_accelerator(accelerator: Arc<Accelerator>) -> Self {
        Context {
            mode: Mode::Accelerator,
            accelerator: Some(accelerator),
            rng: StdRng::from_entropy(),
        }
    }

    /// Reseed the filler RNG, making parameter initialization reproducible.
    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch devices. Switching to `Mode::Accelerator` without an accelerator
    /// is allowed; the next call that needs one fails with `DeviceUnavailable`.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn accelerator(&self) -> Result<&Accelerator> {
        self.accelerator.as_deref().ok_or(Error::DeviceUnavailable)
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::host()
    }
}
