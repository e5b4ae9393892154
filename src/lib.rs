pub mod catalog;
pub mod config;
pub mod error;
pub mod expr;
pub mod image;
pub mod interp;
pub mod interpolant;
pub mod logging;
pub mod model;
pub mod outliers;
pub mod output;
pub mod psf;
pub mod select;
pub mod stamp;
pub mod utils;

#[cfg(test)]
mod test_pipeline;

// Re-export commonly used items
pub use error::{PsfError, Result};
pub use psf::{fit, fit_stamps, FitState, FocalPlaneModel, StarStatus};
