//! Integration tests for the stagehand generation worker

mod test_utils;

mod checkpoint_resume;
mod config_integration;
mod health_surface;
mod logging_default;
mod monitor_live;
mod session_flow;
