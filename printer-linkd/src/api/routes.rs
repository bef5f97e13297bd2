use std::net::IpAddr;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::protocol::API_PREFIX;
use shared::types::DnsCacheEntry;
use crate::error::LinkError;
use crate::resolver::HostResolver;

#[derive(Clone)]
pub struct AppState {
    pub resolver: HostResolver,
    pub hash_rx: watch::Receiver<String>,
}

#[derive(Deserialize)]
pub struct DnsQuery {
    /// Only entries that have not expired yet
    #[serde(default)]
    pub valid: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ResolveResponse {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{}/dns", API_PREFIX), get(get_entries))
        .route(&format!("{}/dns/hash", API_PREFIX), get(get_hash))
        .route(&format!("{}/dns/:hostname", API_PREFIX), get(get_entry))
        .route(&format!("{}/resolve/:hostname", API_PREFIX), get(resolve))
        .with_state(state)
}

async fn get_entries(
    State(state): State<AppState>,
    Query(params): Query<DnsQuery>,
) -> Json<Vec<DnsCacheEntry>> {
    let now = Utc::now();
    let entries = state
        .resolver
        .cache()
        .entries()
        .into_iter()
        .filter(|e| !params.valid || e.is_valid_at(now))
        .collect();
    Json(entries)
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_entry(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<DnsCacheEntry>, StatusCode> {
    state
        .resolver
        .cache()
        .get(&hostname)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn resolve(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<ResolveResponse>, StatusCode> {
    match state.resolver.resolve(&hostname).await {
        Ok(addresses) => Ok(Json(ResolveResponse { hostname, addresses })),
        Err(LinkError::ResolutionFailure { .. }) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to resolve {}: {}", hostname, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use async_trait::async_trait;
    use crate::cache::DnsCache;
    use crate::error::Result;
    use crate::resolver::lookup::NameLookup;

    struct NoNetwork;

    #[async_trait]
    impl NameLookup for NoNetwork {
        async fn system(&self, hostname: &str) -> Result<Vec<IpAddr>> {
            Err(LinkError::resolution(hostname))
        }
        async fn multicast(&self, hostname: &str) -> Result<Vec<IpAddr>> {
            Err(LinkError::resolution(hostname))
        }
        async fn backup(&self, hostname: &str) -> Result<Vec<IpAddr>> {
            Err(LinkError::resolution(hostname))
        }
        async fn upnp(&self, hostname: &str) -> Result<Vec<IpAddr>> {
            Err(LinkError::resolution(hostname))
        }
        async fn is_reachable(&self, _addresses: &[IpAddr]) -> bool {
            false
        }
    }

    async fn serve() -> (SocketAddr, HostResolver) {
        let cache = DnsCache::new(chrono::Duration::seconds(600));
        let resolver = HostResolver::new(cache, Arc::new(NoNetwork));
        let (_hash_tx, hash_rx) = watch::channel("abc123".to_string());
        let app = router(AppState {
            resolver: resolver.clone(),
            hash_rx,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, resolver)
    }

    #[tokio::test]
    async fn test_list_and_resolve() {
        let (addr, resolver) = serve().await;
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5));
        resolver.cache().insert("octopi.local", vec![ip]);

        let client = reqwest::Client::new();
        let entries: Vec<DnsCacheEntry> = client
            .get(format!("http://{}/v1/dns?valid=true", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hostname, "octopi.local");

        let resolved: ResolveResponse = client
            .get(format!("http://{}/v1/resolve/OctoPi.local", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resolved.addresses, vec![ip]);
    }

    #[tokio::test]
    async fn test_unknown_host_is_not_found() {
        let (addr, _resolver) = serve().await;
        let client = reqwest::Client::new();

        let status = client
            .get(format!("http://{}/v1/resolve/nowhere.home", addr))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

        let status = client
            .get(format!("http://{}/v1/dns/nowhere.home", addr))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hash() {
        let (addr, _resolver) = serve().await;
        let body = reqwest::get(format!("http://{}/v1/dns/hash", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "abc123");
    }
}
