pub mod config;
pub mod error;
pub mod events;
pub mod nodes;
pub mod status;

pub use error::{FluxError, FluxResult};
