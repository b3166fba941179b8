//! Lantern - static file HTTP/1.1 server
//!
//! Core library: request pipeline, static file resolution and the
//! epoll-driven server.

pub mod config;
pub mod http;
pub mod server;
