pub mod config;
pub mod errors;
pub mod stats;

pub type Result<T> = std::result::Result<T, errors::SheafError>;
