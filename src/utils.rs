use url::Url;

use crate::error::Result;

/// Spawns `fut` on the ambient tokio runtime. Returns false (and drops the
/// future) when called outside one, e.g. from a plain synchronous test.
pub fn spawn_async<F>(fut: F) -> bool
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
            true
        }
        Err(_) => {
            log::debug!("no tokio runtime; background task skipped");
            false
        }
    }
}

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Realtime endpoint for a REST base url: same host, `ws`/`wss` scheme.
pub fn websocket_url(base_url: &str, path: &str) -> Result<Url> {
    let mut url = Url::parse(&normalize_url(base_url))?;
    let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
    // http(s) -> ws(s) is always an allowed scheme change.
    let _ = url.set_scheme(scheme);
    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}/{}", base_path, path.trim_start_matches('/')));
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_https() {
        assert_eq!(normalize_url(" murmur.example "), "https://murmur.example");
        assert_eq!(normalize_url("http://localhost:8080"), "http://localhost:8080");
    }

    #[test]
    fn websocket_url_swaps_scheme() {
        assert_eq!(
            websocket_url("http://localhost:8080", "/ws").unwrap().as_str(),
            "ws://localhost:8080/ws"
        );
        assert_eq!(
            websocket_url("https://murmur.example/app/", "ws").unwrap().as_str(),
            "wss://murmur.example/app/ws"
        );
    }

    #[test]
    fn spawn_outside_runtime_is_skipped() {
        assert!(!spawn_async(async {}));
    }
}
