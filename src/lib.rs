//! Remote scan agent: accepts authenticated scan triggers, runs nmap, and
//! delivers parsed results to the management service. Also runs scheduled
//! scans on its own.
pub mod config;
pub mod error;
pub mod logging;
pub mod netdetect;
pub mod options;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod tls;
pub mod transform;
pub mod types;
