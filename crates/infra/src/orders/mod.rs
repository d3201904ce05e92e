//! Order persistence (the subset of order state this pipeline owns).

pub mod postgres;
pub mod store;

pub use store::OrderStore;
