//! # docchat core
//!
//! Shared, I/O-free logic for docchat: data models, the page-aware chunker,
//! vector utilities and the embedding trait, storage traits with an
//! in-memory backend, similarity ranking, the chat context cache, and
//! prompt assembly with citation parsing.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Everything that talks to the outside world lives in the `docchat` crate.

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod models;
pub mod prompt;
pub mod search;
pub mod store;
