//! Readiness reactor, worker pool and the event loop tying them together.
//!
//! The event loop thread owns every idle connection. A readable connection is
//! moved into the worker pool; the worker parses and composes a response, then
//! hands the connection back, and the event loop re-arms it. Responses are
//! written from the event loop thread on write readiness.

pub mod listener;
pub mod pool;
pub mod reactor;

pub use listener::{run, serve};
pub use pool::{PoolError, RejectReason, Rejected, WorkerPool};
pub use reactor::{Epoll, Interest, Reactor, Token};
