pub mod boards;
pub mod bus;
pub mod commands;
pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod valuemap;
