pub mod filter;
pub mod request;
pub mod respond;
pub mod server;

pub use request::{ApiRequest, CacheKey, QueryParams, RequestedData, ResponseType};
pub use respond::{AppContext, ResponseArtifact};
pub use server::QueryServer;
