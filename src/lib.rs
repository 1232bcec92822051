pub mod correctness;
pub mod error;
pub mod layers;
pub mod model;

pub use error::{Result, VitError};
