pub mod api;
pub mod args;
pub mod stats;
pub mod types;
pub mod worker;
