pub mod docker;
pub mod executor;
pub mod state;
pub mod types;
