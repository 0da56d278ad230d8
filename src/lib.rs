pub mod config;
pub mod orchestration;
pub mod shared;
