//! HTTP surface: admission middleware, health endpoint and server.

mod admission;
mod health;
mod server;

pub use admission::{
    admission_middleware, AdmissionGate, CallerIdentity, Outcome, Rejection,
    FORWARDED_FOR_HEADER, TOKEN_HEADER,
};
pub use health::health;
pub use server::{protect, router, HttpServer};
