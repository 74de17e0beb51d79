//! Quire: an HTTP response cache kept coherent across processes by
//! pub/sub invalidation, fronting a small demo content API.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod messenger;
