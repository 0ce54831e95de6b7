pub mod config;
pub mod database_ops;
pub mod feed;
pub mod orchestrator;
pub mod telemetry;

pub mod util {
    pub mod env;
}
