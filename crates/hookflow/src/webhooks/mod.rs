pub mod ingest;
pub mod memory;
pub mod model;
pub mod payload;
pub mod platform;
pub mod records;
pub mod repo;
pub mod signature;
pub mod store;
