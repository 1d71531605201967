pub mod memory;
pub mod records;
pub mod types;
