//! Span builder helpers for gatehouse instrumentation.

/// Create the top-level span for one proxied request.
///
/// `verdict` and `status` are recorded once the gate and the backend answer.
#[macro_export]
macro_rules! proxy_request_span {
    ($request_id:expr, $method:expr, $path:expr) => {
        tracing::info_span!(
            "proxy_request",
            request_id = %$request_id,
            method = %$method,
            path = %$path,
            verdict = tracing::field::Empty,
            status = tracing::field::Empty,
        )
    };
}

/// Create a span for one call to the authorization service.
#[macro_export]
macro_rules! auth_check_span {
    ($request_id:expr, $endpoint:expr) => {
        tracing::info_span!(
            "auth_check",
            request_id = %$request_id,
            endpoint = %$endpoint,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a span for forwarding a request to one backend target.
///
/// `bytes_relayed` and `total_duration_ms` are recorded by the relayed body
/// when the backend stream ends.
#[macro_export]
macro_rules! backend_forward_span {
    ($request_id:expr, $backend:expr) => {
        tracing::info_span!(
            "backend_forward",
            request_id = %$request_id,
            backend = %$backend,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            bytes_relayed = tracing::field::Empty,
            total_duration_ms = tracing::field::Empty,
        )
    };
}
