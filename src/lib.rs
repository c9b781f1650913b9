//! FH-PS segmentation network for candle
//!
//! Convolutional encoder-decoder with a dual attention bottleneck, a
//! multi-scale feature selection module and a directional guidance branch,
//! targeting fetal head / pubic symphysis segmentation in ultrasound frames.

pub mod attention;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod guidance;
pub mod interpolate;
pub mod model;
pub mod msfsm;
pub mod preprocess;
pub mod train;

pub use config::{DirectionMode, FhpsConfig};
pub use model::{CompleteModel, SegmentationOutput};
pub use train::Trainer;
