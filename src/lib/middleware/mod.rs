pub mod credentials;
pub mod options;
pub mod registry;
pub mod types;
pub mod volumes;
