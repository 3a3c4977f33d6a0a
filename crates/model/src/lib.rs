pub mod config;
pub mod linear;
pub mod model;

pub use config::{Activation, ModelConfig};
pub use linear::{Linear, LinearConfig, LinearInit};
pub use model::Model;
