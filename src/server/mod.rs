//! HTTP server for the join API

mod http;

pub use http::{route, run, AppState};
