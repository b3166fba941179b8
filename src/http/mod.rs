//! HTTP protocol implementation.
//!
//! This module implements the per-connection request pipeline of a static
//! file server: GET only, HTTP/1.1 only, with keep-alive connections.
//!
//! # Architecture
//!
//! - **`buffer`**: Fixed-capacity read buffer with parser cursors, and the bounded header buffer
//! - **`request`**: Parsed request fields, stored as ranges into the read buffer
//! - **`parser`**: Incremental request-line/header/body state machine
//! - **`resolver`**: Maps targets onto files under the document root (mmap or streamed)
//! - **`response`**: Status codes and response head composition
//! - **`writer`**: Scatter writes that resume across partial writes
//! - **`connection`**: Per-socket state tying the pieces together
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← read() on read readiness (event loop)
//!        └──────┬──────┘
//!               │ Bytes buffered
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← process() on a worker
//!        └──────┬───────────┘
//!               ├─ Need more data → Reading
//!               │ Response composed
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← write() on write readiness, may take several
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod buffer;
pub mod connection;
pub mod parser;
pub mod request;
pub mod resolver;
pub mod response;
pub mod writer;
