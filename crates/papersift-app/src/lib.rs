//! Papersift: the document lifecycle engine. PDFs come in, a vision model
//! pulls structured fields out page by page (with an OCR fallback), results
//! land in an LMDB metadata store, and the controller serves them back out as
//! spreadsheets. The HTTP adapter lives in the `papersift-server` crate.

pub mod config;
pub mod controller;
pub mod document;
pub mod error;
pub mod excel;
pub mod paths;
pub mod pipeline;
pub mod schema;
pub mod services;
pub mod store;
pub mod worker;

pub use controller::Controller;
pub use error::AppError;
pub use services::{Services, build_services};
