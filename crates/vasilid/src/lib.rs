//! Vasili service
//!
//! Ties the wireless layer together: the orchestration cycle, scoring,
//! LAN bridging, uplink monitoring, persistence and the HTTP API.

pub mod api;
pub mod bridge;
pub mod config;
pub mod monitor;
pub mod node;
pub mod orchestrator;
pub mod scoring;
pub mod selector;
pub mod storage;
