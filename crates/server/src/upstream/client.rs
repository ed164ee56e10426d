//! HTTP client for remote upstreams.

use super::challenge::{BearerChallenge, parse_bearer_challenge};
use super::{
    ArtifactFetcher, FetchedArtifact, ProbeOutcome, UpstreamError, UpstreamProber, artifact_url,
    forwarded_headers, response_etag,
};
use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use url::{Host, Url};
use uuid::Uuid;
use vreg_core::config::UpstreamConfig;
use vreg_core::{ArtifactPath, Credentials, OutboundGuard, RegistryType, UpstreamLocation};
use vreg_metadata::models::UpstreamRow;

const MAX_REDIRECTS: usize = 5;

/// Registry tokens are dropped this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v2+json";

#[derive(Deserialize)]
struct RegistryTokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Remote upstream client: existence probes and streaming downloads.
///
/// Every request target, including redirect hops and token realms, passes
/// [`UpstreamClient::check_url`]: the [`OutboundGuard`] and, unless the host
/// is allow-listed, the addresses its hostname resolves to. Redirects are
/// followed here rather than by reqwest so each hop gets the same check.
/// Credentials are only sent to the origin of the original request.
pub struct UpstreamClient {
    http: reqwest::Client,
    guard: OutboundGuard,
    probe_timeout: Duration,
    /// Registry bearer tokens keyed by (upstream, scope).
    tokens: DashMap<(Uuid, String), CachedToken>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let guard = OutboundGuard::new(config.allow_local_requests, &config.allowed_hosts);

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UpstreamError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            guard,
            probe_timeout: config.probe_timeout(),
            tokens: DashMap::new(),
        })
    }

    /// Check a URL against the guard, then the addresses its host resolves to.
    pub async fn check_url(&self, raw: &str) -> Result<Url, UpstreamError> {
        let url = self
            .guard
            .check(raw)
            .map_err(|denied| UpstreamError::Denied(denied.0))?
            .url;

        if let Some(Host::Domain(domain)) = url.host()
            && !self.guard.host_is_allow_listed(domain)
        {
            let port = url.port_or_known_default().unwrap_or(443);
            let addrs = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| UpstreamError::Transport(format!("dns lookup for {domain}: {e}")))?;
            for addr in addrs {
                self.guard
                    .check_ip(addr.ip())
                    .map_err(|denied| UpstreamError::Denied(denied.0))?;
            }
        }

        Ok(url)
    }

    /// Issue a request, following redirects hop by hop. `auth` decorates
    /// requests to the origin of `url` only.
    async fn execute<F>(
        &self,
        method: Method,
        url: Url,
        timeout: Option<Duration>,
        accept: Option<&'static str>,
        auth: F,
    ) -> Result<Response, UpstreamError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let origin = url.origin();
        let mut url = url;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.http.request(method.clone(), url.clone());
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if url.origin() == origin {
                request = auth(request);
            }

            let response = request.send().await?;
            if !response.status().is_redirection() {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Ok(response);
            };

            let next = url
                .join(location)
                .map_err(|e| UpstreamError::Denied(format!("invalid redirect location: {e}")))?;
            url = self.check_url(next.as_str()).await?;
            debug!(status = response.status().as_u16(), "following upstream redirect");
        }

        Err(UpstreamError::Transport(format!(
            "more than {MAX_REDIRECTS} redirects"
        )))
    }

    async fn send(
        &self,
        method: Method,
        upstream: &UpstreamRow,
        path: &ArtifactPath,
        timeout: Option<Duration>,
    ) -> Result<Response, UpstreamError> {
        let (base, credentials) = match upstream
            .location()
            .map_err(|e| UpstreamError::Config(e.to_string()))?
        {
            UpstreamLocation::Remote { url, credentials } => (url, credentials),
            UpstreamLocation::Local { .. } => {
                return Err(UpstreamError::Config(format!(
                    "upstream {} is project-backed and has no url",
                    upstream.upstream_id
                )));
            }
        };
        let registry_type = upstream
            .registry_type()
            .map_err(|e| UpstreamError::Config(e.to_string()))?;
        let url = self
            .check_url(&artifact_url(registry_type, &base, path))
            .await?;

        let scope = match registry_type {
            RegistryType::Container => path.container_scope(),
            RegistryType::Maven => None,
        };
        let bearer = scope
            .as_ref()
            .and_then(|scope| self.cached_token(upstream.upstream_id, scope));

        let accept = (registry_type == RegistryType::Container && path.is_manifest())
            .then_some(MANIFEST_ACCEPT);

        let response = self
            .execute(method.clone(), url.clone(), timeout, accept, |request| {
                authorize(request, bearer.as_deref(), credentials.as_ref())
            })
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED || registry_type != RegistryType::Container
        {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
        else {
            return Ok(response);
        };

        let scope = scope.or_else(|| challenge.scope.clone()).unwrap_or_default();
        let token = self
            .fetch_token(upstream.upstream_id, &challenge, &scope, credentials.as_ref())
            .await?;
        debug!(upstream_id = %upstream.upstream_id, %scope, "retrying with registry token");
        self.execute(method, url, timeout, accept, |request| {
            authorize(request, Some(&token), credentials.as_ref())
        })
        .await
    }

    fn cached_token(&self, upstream_id: Uuid, scope: &str) -> Option<String> {
        let key = (upstream_id, scope.to_string());
        let token = self.tokens.get(&key)?;
        if token.expires_at > Instant::now() {
            Some(token.token.clone())
        } else {
            drop(token);
            self.tokens.remove(&key);
            None
        }
    }

    async fn fetch_token(
        &self,
        upstream_id: Uuid,
        challenge: &BearerChallenge,
        scope: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String, UpstreamError> {
        let mut realm = self.check_url(&challenge.realm).await?;
        {
            let mut query = realm.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
        }

        let response = self
            .execute(Method::GET, realm, Some(self.probe_timeout), None, |request| {
                authorize(request, None, credentials)
            })
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Auth(format!(
                "token service responded with status {}",
                response.status().as_u16()
            )));
        }

        let body: RegistryTokenResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Auth(format!("invalid token response: {}", e.without_url())))?;
        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| UpstreamError::Auth("token response carried no token".to_string()))?;

        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME)
            .saturating_sub(TOKEN_EXPIRY_MARGIN);
        if !lifetime.is_zero() {
            self.tokens.insert(
                (upstream_id, scope.to_string()),
                CachedToken {
                    token: token.clone(),
                    expires_at: Instant::now() + lifetime,
                },
            );
        }
        Ok(token)
    }
}

fn authorize(
    request: RequestBuilder,
    bearer: Option<&str>,
    credentials: Option<&Credentials>,
) -> RequestBuilder {
    match (bearer, credentials) {
        (Some(token), _) => request.bearer_auth(token),
        (None, Some(creds)) => request.basic_auth(&creds.username, Some(&creds.password)),
        (None, None) => request,
    }
}

#[async_trait]
impl UpstreamProber for UpstreamClient {
    #[instrument(skip(self, upstream, path), fields(upstream_id = %upstream.upstream_id, path = %path))]
    async fn probe(
        &self,
        upstream: &UpstreamRow,
        path: &ArtifactPath,
    ) -> Result<ProbeOutcome, UpstreamError> {
        let response = match self
            .send(Method::HEAD, upstream, path, Some(self.probe_timeout))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                metrics::UPSTREAM_PROBES.with_label_values(&["error"]).inc();
                warn!(error = %e, "upstream probe failed");
                return Err(e);
            }
        };

        let status = response.status();
        if status.is_success() {
            metrics::UPSTREAM_PROBES.with_label_values(&["found"]).inc();
            Ok(ProbeOutcome::Found {
                etag: response_etag(response.headers()),
            })
        } else {
            metrics::UPSTREAM_PROBES
                .with_label_values(&["not_found"])
                .inc();
            debug!(status = status.as_u16(), "artifact not on upstream");
            Ok(ProbeOutcome::NotFound {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl ArtifactFetcher for UpstreamClient {
    #[instrument(skip(self, upstream, path), fields(upstream_id = %upstream.upstream_id, path = %path))]
    async fn fetch(
        &self,
        upstream: &UpstreamRow,
        path: &ArtifactPath,
    ) -> Result<FetchedArtifact, UpstreamError> {
        let response = self.send(Method::GET, upstream, path, None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let headers = forwarded_headers(response.headers());
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let etag = response_etag(&headers);
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(UpstreamError::from)
            .boxed();

        Ok(FetchedArtifact {
            content_type,
            etag,
            content_length,
            headers,
            body,
        })
    }
}
