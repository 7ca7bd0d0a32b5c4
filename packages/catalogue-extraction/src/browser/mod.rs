//! Browser implementations.

pub mod http;

pub use http::HttpBrowser;
