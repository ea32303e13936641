pub mod config;
pub mod counters;
pub mod crypto;
pub mod db;
pub mod jobs;
pub mod plans;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod service_ctx;
pub mod signing;
pub mod state;
pub mod stripe;
pub mod worker;
