pub mod devices;
pub mod error;
pub mod mqtt;
pub mod persistence;
pub mod registry;
pub mod topics;
