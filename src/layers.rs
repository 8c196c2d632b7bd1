//! Concrete layers, and the registry that builds them from config records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Layer, Result, Scalar};

mod inner_product;
pub use inner_product::{InnerProductConfig, InnerProductLayer, NORM_EPSILON};

mod softmax_loss;
pub use softmax_loss::SoftmaxMultilabelLossLayer;

/// Type tag of a layer, as it appears in config records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    InnerProduct,
    SoftmaxMultilabelLoss,
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            LayerType::InnerProduct => "InnerProduct",
            LayerType::SoftmaxMultilabelLoss => "SoftmaxMultilabelLoss",
        };
        f.write_str(tag)
    }
}

/// Settings for one layer, as handed over by whatever loads the model
/// definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    #[serde(flatten)]
    pub params: LayerParams,
}

/// Type-specific settings, keyed by the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LayerParams {
    InnerProduct(InnerProductConfig),
    SoftmaxMultilabelLoss,
}

impl LayerConfig {
    pub fn layer_type(&self) -> LayerType {
        match self.params {
            LayerParams::InnerProduct(_) => LayerType::InnerProduct,
            LayerParams::SoftmaxMultilabelLoss => LayerType::SoftmaxMultilabelLoss,
        }
    }
}

/// Build the layer described by `config`.
pub fn create_layer<T: Scalar>(config: &LayerConfig) -> Result<Box<dyn Layer<T>>> {
    Ok(match &config.params {
        LayerParams::InnerProduct(params) => {
            Box::new(InnerProductLayer::new(&config.name, params.clone())?)
        }
        LayerParams::SoftmaxMultilabelLoss => {
            Box::new(SoftmaxMultilabelLossLayer::new(&config.name))
        }
    })
}
