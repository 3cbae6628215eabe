//! Generic HTTP backend for remote state.
//!
//! State lives at a single URL: `GET` reads it, `POST` replaces it and
//! `DELETE` removes it. Payloads carry a `Content-MD5` header both ways.
//! There is no locking.

mod state;

pub use state::{HttpState, HttpStateConfig};
