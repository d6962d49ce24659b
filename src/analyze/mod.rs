//! URL-target analysis phases
//!
//! The `headers` phase inspects HTTP response headers; the `url` phase
//! inspects the URL itself and pattern-scans a bounded slice of the page
//! body. Both emit findings in the same shape as the file pipeline.

pub mod headers;
pub mod url;

pub use headers::HeaderAnalyzer;
pub use url::UrlAnalyzer;
