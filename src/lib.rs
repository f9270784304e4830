pub mod cache;
pub mod checks;
pub mod client;
pub mod config;
pub mod dev_service;
pub mod env_state;
pub mod instance;
pub mod launch;
pub mod logging;
pub mod model;
pub mod paths;
pub mod policy;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod shell;
pub mod types;
