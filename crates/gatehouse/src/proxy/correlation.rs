//! Correlation ID generation for request tracing.

use uuid::Uuid;

/// Header carrying the per-request id to the authorization service and the
/// backend.
pub const CORRELATION_HEADER: &str = "x-gatehouse-request-id";

/// Generate a new correlation ID (UUID v4).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
