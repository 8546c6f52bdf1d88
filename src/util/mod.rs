//! Shared helpers.
//!
//! - **URL validation**: security-focused validation to prevent SSRF attacks
//! - **Sanitization**: control-character stripping for remote-supplied text

mod sanitize;
mod url_validator;

pub use sanitize::strip_control_chars;
pub use url_validator::{validate_url, UrlValidationError};
