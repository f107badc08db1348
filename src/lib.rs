pub mod config;
pub mod errors;
pub mod extraction;
pub mod gemini;
pub mod logging;
pub mod memory;
pub mod messaging;
pub mod models;
pub mod results;
pub mod routes;
pub mod status_store;
pub mod submitter;
pub mod summarizer;
pub mod worker_loop;
pub mod worker_processing;
