#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod query;
pub mod spectra;

pub use error::ApiError;
