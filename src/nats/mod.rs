pub mod client;

pub use client::NatsObjectStore;
