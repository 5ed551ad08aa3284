use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use super::proxy::{ProxyDriver, Route};
use async_trait::async_trait;
use lobster_core::config::{CaddyConfig, LobsterdConfig};
use lobster_core::error::{Error, Result};

/// Server name inside the Caddy config tree owned by lobsterd.
const SERVER: &str = "lobsterd";

/// Reverse proxy over the Caddy admin API. Tenant routes are objects
/// tagged `@id: lobsterd-<name>` so they can be addressed individually.
pub struct CaddyDriver {
    admin_api: String,
    tls: bool,
    certs_dir: String,
    client: reqwest::Client,
}

impl CaddyDriver {
    pub fn new(config: &CaddyConfig) -> Self {
        Self {
            admin_api: config.admin_api.trim_end_matches('/').to_string(),
            tls: config.tls,
            certs_dir: LobsterdConfig::certs_dir().to_string_lossy().to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
        }
    }

    fn route_id(name: &str) -> String {
        format!("lobsterd-{}", name)
    }

    fn routes_url(&self) -> String {
        format!(
            "{}/config/apps/http/servers/{}/routes",
            self.admin_api, SERVER
        )
    }

    async fn api_error(resp: reqwest::Response) -> Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Error::CaddyApiError(format!("{}: {}", status, body.trim()))
    }

    /// The base server skeleton tenant routes are added into.
    fn base_config(&self) -> Value {
        let listen = if self.tls { ":443" } else { ":80" };
        let mut cfg = json!({
            "apps": {
                "http": {
                    "servers": {
                        SERVER: {
                            "listen": [listen],
                            "routes": [],
                        }
                    }
                }
            }
        });
        if self.tls {
            cfg["apps"]["tls"] = json!({
                "certificates": {
                    "load_files": [{
                        "certificate": format!("{}/origin.pem", self.certs_dir),
                        "key": format!("{}/origin.key", self.certs_dir),
                    }]
                }
            });
        }
        cfg
    }
}

#[async_trait]
impl ProxyDriver for CaddyDriver {
    async fn add_route(&self, name: &str, host: &str, upstream_port: u16) -> Result<()> {
        // Replace semantics: drop any stale route for this tenant first.
        self.remove_route(name).await?;

        let route = json!({
            "@id": Self::route_id(name),
            "match": [{"host": [host]}],
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{"dial": format!("127.0.0.1:{}", upstream_port)}],
            }],
        });
        let resp = self
            .client
            .post(self.routes_url())
            .json(&route)
            .send()
            .await
            .map_err(|e| Error::CaddyApiError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        info!(tenant = name, host, upstream_port, "proxy route added");
        Ok(())
    }

    async fn remove_route(&self, name: &str) -> Result<()> {
        let url = format!("{}/id/{}", self.admin_api, Self::route_id(name));
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Error::CaddyApiError(e.to_string()))?;
        // Unknown id means the route is already gone.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Self::api_error(resp).await);
        }
        debug!(tenant = name, "proxy route removed");
        Ok(())
    }

    async fn list_routes(&self) -> Result<Vec<Route>> {
        let resp = self
            .client
            .get(self.routes_url())
            .send()
            .await
            .map_err(|e| Error::CaddyApiError(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let raw: Value = resp
            .json()
            .await
            .map_err(|e| Error::CaddyApiError(e.to_string()))?;
        Ok(parse_routes(&raw))
    }

    async fn write_base_config(&self) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/load", self.admin_api))
            .json(&self.base_config())
            .send()
            .await
            .map_err(|e| Error::CaddyApiError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        info!("caddy base config loaded");
        Ok(())
    }

    async fn healthy(&self) -> bool {
        self.client
            .get(format!("{}/config/", self.admin_api))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Pull `(name, host, upstream_port)` back out of the Caddy route array.
fn parse_routes(raw: &Value) -> Vec<Route> {
    let mut routes = Vec::new();
    let Some(items) = raw.as_array() else {
        return routes;
    };
    for item in items {
        let Some(id) = item.get("@id").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(name) = id.strip_prefix("lobsterd-") else {
            continue;
        };
        let host = item["match"][0]["host"][0]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let dial = item["handle"][0]["upstreams"][0]["dial"]
            .as_str()
            .unwrap_or_default();
        let upstream_port = dial
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        routes.push(Route {
            name: name.to_string(),
            host,
            upstream_port,
        });
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_id() {
        assert_eq!(CaddyDriver::route_id("alice"), "lobsterd-alice");
    }

    #[test]
    fn test_parse_routes_extracts_fields() {
        let raw = json!([
            {
                "@id": "lobsterd-alice",
                "match": [{"host": ["alice.lobster.local"]}],
                "handle": [{
                    "handler": "reverse_proxy",
                    "upstreams": [{"dial": "127.0.0.1:9000"}],
                }],
            },
            // Route owned by someone else: ignored.
            {"@id": "metrics", "match": [{"host": ["metrics.local"]}]},
            // Untagged route: ignored.
            {"match": [{"host": ["other.local"]}]},
        ]);
        let routes = parse_routes(&raw);
        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes[0],
            Route {
                name: "alice".to_string(),
                host: "alice.lobster.local".to_string(),
                upstream_port: 9000,
            }
        );
    }

    #[test]
    fn test_parse_routes_non_array() {
        assert!(parse_routes(&json!(null)).is_empty());
    }

    #[test]
    fn test_base_config_plain_http() {
        let driver = CaddyDriver::new(&CaddyConfig::default());
        let cfg = driver.base_config();
        assert_eq!(cfg["apps"]["http"]["servers"][SERVER]["listen"][0], ":80");
        assert!(cfg["apps"].get("tls").is_none());
    }

    #[test]
    fn test_base_config_tls_loads_origin_material() {
        let mut caddy = CaddyConfig::default();
        caddy.tls = true;
        let driver = CaddyDriver::new(&caddy);
        let cfg = driver.base_config();
        assert_eq!(cfg["apps"]["http"]["servers"][SERVER]["listen"][0], ":443");
        let cert = cfg["apps"]["tls"]["certificates"]["load_files"][0]["certificate"]
            .as_str()
            .unwrap();
        assert!(cert.ends_with("origin.pem"));
    }
}
