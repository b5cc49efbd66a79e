pub mod guidance;
pub mod maintenance;
pub mod scoring;
pub mod search;
pub mod stats;
pub mod store;
pub mod types;
