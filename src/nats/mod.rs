//! NATS connectivity for the notification listener

pub mod client;

pub use client::NatsClient;
