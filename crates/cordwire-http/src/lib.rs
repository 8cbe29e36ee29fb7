pub mod client;
pub mod config;
pub mod error;
mod multipart;
pub mod path;
pub mod ratelimit;
pub mod request;
pub mod routes;
pub mod transport;

pub use client::{Client, Response};
pub use config::HttpConfig;
pub use error::{HttpError, HttpStatusError};
pub use path::PathKey;
pub use ratelimit::{RateLimiter, Release, Ticket};
pub use request::RequestOptions;
pub use transport::{RateLimitedTransport, Transport};

pub use reqwest::Method;
