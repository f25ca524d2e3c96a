//! Utility functions and helpers.

mod logging;
mod signal;

pub use logging::init_logging;
pub use signal::on_interrupt;
