//! HTTP adapter for the papersift engine plus the service binary's CLI.

pub mod cli;
pub mod server;

pub use server::{ServerError, build_router, serve};
