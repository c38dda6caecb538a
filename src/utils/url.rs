//! URL utilities for consistent endpoint construction
//!
//! The server base URL arrives from config or the environment and may
//! carry trailing slashes; everything that builds a request URL goes
//! through here so the HTTP and WebSocket layers agree on the result.

/// Normalize a base URL by removing trailing slashes
///
/// # Examples
///
/// ```
/// use charla::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("http://localhost:8080/"), "http://localhost:8080");
/// assert_eq!(normalize_base_url("https://chat.example.com"), "https://chat.example.com");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path
///
/// # Examples
///
/// ```
/// use charla::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("http://localhost:8080/", "/api/rooms/public"),
///     "http://localhost:8080/api/rooms/public"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Derive the WebSocket endpoint from the HTTP base URL
///
/// Substitutes the scheme (`http` -> `ws`, `https` -> `wss`) and appends
/// the fixed `/ws` path. A base URL that already carries a ws scheme is
/// left alone apart from the path, which keeps local shorthand usable.
///
/// # Examples
///
/// ```
/// use charla::utils::url::websocket_url;
///
/// assert_eq!(websocket_url("http://localhost:8080"), "ws://localhost:8080/ws");
/// assert_eq!(websocket_url("https://chat.example.com/"), "wss://chat.example.com/ws");
/// ```
pub fn websocket_url(base_url: &str) -> String {
    let base = normalize_base_url(base_url);
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base
    };
    format!("{}/ws", base)
}
