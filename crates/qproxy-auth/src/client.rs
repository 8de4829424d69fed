use std::sync::{Arc, OnceLock};

use wreq::Proxy;

struct SharedClient {
    proxy: Option<String>,
    client: Arc<wreq::Client>,
}

static SHARED_CLIENT: OnceLock<SharedClient> = OnceLock::new();

/// Process-wide HTTP client honoring the configured outbound proxy.
///
/// All upstream traffic (poller fetches, token refresh, executor calls)
/// goes through this client so proxy settings apply uniformly. Only one
/// global proxy is supported; requesting a different one is an error.
pub fn shared_client(proxy: Option<&str>) -> Result<Arc<wreq::Client>, String> {
    let proxy_owned = proxy.map(|value| value.to_string());
    if let Some(shared) = SHARED_CLIENT.get() {
        if shared.proxy != proxy_owned {
            return Err("proxy mismatch: only a single global proxy is supported".to_string());
        }
        return Ok(shared.client.clone());
    }

    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = proxy {
        let proxy = Proxy::all(proxy_url).map_err(|err| err.to_string())?;
        builder = builder.proxy(proxy);
    }
    let client = builder.build().map_err(|err| err.to_string())?;

    let shared = SharedClient {
        proxy: proxy_owned,
        client: Arc::new(client),
    };
    let _ = SHARED_CLIENT.set(shared);
    Ok(SHARED_CLIENT
        .get()
        .expect("shared client must be set")
        .client
        .clone())
}
