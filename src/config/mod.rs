//! Configuration loading, parsing, and validation.

mod loader;
mod types;
mod validation;

pub use loader::load_config;
pub use types::{
    BufferSection, Config, LogFormat, NodeSection, OneOrMany, ServerSection, ServiceSection,
};
pub use validation::{
    parse_balancing, parse_protocols, parse_session, resolve_config, NodeSpec, ServiceSpec,
};
