pub mod client;
pub mod config;
pub mod controller;
pub mod counter;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod report;
pub mod resolve;
pub mod utils;
pub mod worker;
