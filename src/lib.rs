//! Layer execution engine: blobs with host/accelerator copies, a `Layer`
//! contract with forward and backward passes, and a fully-connected layer.

mod error;
pub use error::{Error, Result};

mod traits;
pub use traits::{Layer, Scalar};

mod blob;
pub use blob::{Blob, Shape};

mod context;
pub use context::{Context, Mode};

pub mod device;
pub use device::{Accelerator, AcceleratorConfig};

pub mod filler;
pub use filler::FillerConfig;

pub mod gradient_check;
pub mod layers;
pub mod math;
pub mod memory;

mod param;
pub use param::Param;
