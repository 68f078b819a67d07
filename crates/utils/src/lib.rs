pub mod response;

/// Crate version reported by the health endpoint.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
