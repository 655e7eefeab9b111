//! Expressway: a small HTTP request pipeline.
//!
//! A router dispatches requests to handlers by method and path pattern, a
//! middleware chain runs ordered stages with error short-circuiting, and
//! an upload subsystem streams multipart bodies to disk. Registration
//! happens on an [`app::App`] during setup; [`app::App::build`] freezes it
//! into the immutable service the server dispatches through.

pub mod app;
pub mod config;
pub mod context;
pub mod error;
pub mod logger;
pub mod middleware;
pub mod response;
pub mod router;
pub mod server;
pub mod upload;
