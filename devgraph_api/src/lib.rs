pub mod config;
pub mod constants;
pub mod descriptor;
pub mod error;
pub mod primitives;

pub use primitives::size::Size;
