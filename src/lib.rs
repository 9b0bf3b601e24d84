pub mod checkpoint;
pub mod config;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod input;
pub mod pipeline;
pub mod pool;
pub mod record;
pub mod schema;
