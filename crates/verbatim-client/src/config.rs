use anyhow::Result;
use url::Url;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub gateway_url: Url,
}

impl ClientConfig {
    /// Read configuration from the environment, loading `.env` if present.
    ///
    /// `VERBATIM_API_URL` defaults to the local dev server; the gateway URL
    /// is derived from it unless `VERBATIM_GATEWAY_URL` overrides it.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let api_url =
            std::env::var("VERBATIM_API_URL").unwrap_or_else(|_| "http://127.0.0.1:4000".into());
        let api_url = Url::parse(&api_url)?;

        let gateway_url = match std::env::var("VERBATIM_GATEWAY_URL") {
            Ok(explicit) => Url::parse(&explicit)?,
            Err(_) => derive_gateway_url(&api_url)?,
        };

        Ok(Self {
            api_url,
            gateway_url,
        })
    }

    /// Build a config for a known pair of endpoints (tests, embedders with
    /// their own settings source).
    pub fn new(api_url: Url, gateway_url: Url) -> Self {
        Self {
            api_url,
            gateway_url,
        }
    }
}

/// The gateway lives next to the REST API: same host, ws scheme, `/gateway`.
fn derive_gateway_url(api: &Url) -> Result<Url> {
    let ws = api
        .as_str()
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    let ws = format!("{}/gateway", ws.trim_end_matches('/'));
    Ok(Url::parse(&ws)?)
}
