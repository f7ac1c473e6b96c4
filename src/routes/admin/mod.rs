mod accounts;
mod config;
mod keys;
mod oauth;
mod stats;

// Glob re-exports so utoipa's `routes!()` macro can find the hidden `__path_*`
// structs alongside the handler functions at the `crate::routes::admin::*` path.
pub use accounts::*;
pub use config::*;
pub use keys::*;
pub use oauth::*;
pub use stats::*;

use serde::Serialize;
use utoipa::ToSchema;

// --- Shared response types ---

#[derive(Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

// --- Validation helpers ---

const MAX_NAME_LENGTH: usize = 100;

pub(super) fn validate_name(name: &str) -> Result<(), &'static str> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Name cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("Name too long (max 100 characters)");
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("Name cannot contain control characters");
    }
    Ok(())
}

pub(super) fn validate_endpoint(url: &str) -> Result<(), &'static str> {
    let parsed = url::Url::parse(url).map_err(|_| "Endpoint must be a valid URL")?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err("Endpoint must be http or https");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("work-account").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name("bad\nname").is_err());
        assert!(validate_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("https://api.example.com").is_ok());
        assert!(validate_endpoint("http://localhost:8000").is_ok());
        assert!(validate_endpoint("ftp://example.com").is_err());
        assert!(validate_endpoint("not a url").is_err());
    }
}
