#![forbid(unsafe_code)]

//! Shared library behind the grabtube server and maintenance binaries.

pub mod config;
pub mod error;
pub mod extract;
pub mod history;
pub mod security;
pub mod storage;
pub mod sweeper;
pub mod telemetry;
