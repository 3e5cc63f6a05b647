pub mod config;
pub mod console;
pub mod device_client;
pub mod errors;
pub mod events;
pub mod http_client;
pub mod services;

pub use services::workflow::{Completion, OtaWorkflow};
