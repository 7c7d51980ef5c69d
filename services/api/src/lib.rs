//! Sonic API Library Crate
//!
//! HTTP front-end for the translation session manager: application state,
//! handlers, and routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
