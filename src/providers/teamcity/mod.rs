mod builds;
mod client;
mod queue;
mod types;


pub use client::{TeamCityClient, DEFAULT_REQUEST_TIMEOUT};
