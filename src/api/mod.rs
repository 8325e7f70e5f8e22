pub mod cluster;
pub mod sandbox_config;
