pub mod config;
pub mod error;
pub mod resources;
pub(crate) mod tensor_ops;

pub use config::Config;
