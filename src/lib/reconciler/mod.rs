pub mod ports;
pub mod reconciler;
