//! WebDAV implementation of [`RemoteStore`].
//!
//! Partial writes use `PUT` with a `Content-Range` header, which Apache
//! mod_dav and SabreDAV both accept. Zero-length ranged writes cannot be
//! expressed that way, so they are emulated: a missing resource is created
//! with an empty `PUT`, and a resource shorter than the requested offset is
//! extended by writing a single zero byte at `offset - 1`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::DavConfig;
use crate::error::{Result, StoreError};
use crate::multistatus::{parse_multistatus, PropEntry, PROPFIND_BODY};
use crate::store::{base_name, normalize_path, Depth, Metadata, RemoteStore};

/// HTTP client for one WebDAV base URL.
pub struct DavClient {
    client: Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

fn method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).unwrap_or(Method::GET)
}

/// MKCOL answers 405 when something already exists at the target.
fn mkcol_error(err: StoreError) -> StoreError {
    match err {
        StoreError::Http { status: 405, path } => StoreError::AlreadyExists { path },
        other => other,
    }
}

impl DavClient {
    pub fn new(config: &DavConfig) -> Result<Self> {
        let mut base = Url::parse(&config.url).map_err(|e| StoreError::Protocol {
            reason: format!("invalid base url {}: {}", config.url, e),
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolve a filesystem path against the base URL, percent-encoding
    /// each segment and keeping a trailing separator if present.
    pub fn url_for(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let mut full = self.base.path().trim_end_matches('/').to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            full.push('/');
            full.push_str(&urlencoding::encode(segment));
        }
        if path.ends_with('/') || full.is_empty() {
            full.push('/');
        }
        url.set_path(&full);
        url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url_for(path));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> Result<Response> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        debug!("dav: {} -> {}", path, status);
        Err(StoreError::from_status(status.as_u16(), path))
    }

    async fn propfind(&self, path: &str, depth: Depth) -> Result<Vec<PropEntry>> {
        let builder = self
            .request(method("PROPFIND"), path)
            .header("Depth", depth.as_header())
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let resp = self.send(builder, path).await?;
        if resp.status() != StatusCode::MULTI_STATUS {
            return Err(StoreError::Protocol {
                reason: format!("PROPFIND {} returned {}", path, resp.status()),
            });
        }
        let body = resp.text().await?;
        parse_multistatus(&body)
    }

    /// Path of an href relative to the base, normalized.
    fn relative(&self, href: &str) -> String {
        let base = urlencoding::decode(self.base.path())
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| self.base.path().to_string());
        let base = base.trim_end_matches('/');
        let rel = href.strip_prefix(base).unwrap_or(href);
        normalize_path(rel)
    }

    async fn put(&self, path: &str, data: &[u8], range: Option<(u64, u64)>) -> Result<bool> {
        let mut builder = self
            .request(Method::PUT, path)
            .body(Bytes::copy_from_slice(data));
        if let Some((start, end)) = range {
            builder = builder.header(CONTENT_RANGE, format!("bytes {}-{}/*", start, end));
        }
        let resp = self.send(builder, path).await?;
        Ok(resp.status() == StatusCode::CREATED)
    }
}

#[async_trait]
impl RemoteStore for DavClient {
    async fn stat(&self, path: &str) -> Result<Metadata> {
        let entries = self.propfind(path, Depth::Zero).await?;
        let entry = entries.into_iter().next().ok_or_else(|| StoreError::Protocol {
            reason: format!("empty multistatus for {}", path),
        })?;
        let name = base_name(path).to_string();
        Ok(entry.into_metadata(&name))
    }

    async fn list(&self, path: &str, depth: Depth) -> Result<Vec<Metadata>> {
        let target = normalize_path(path);
        let entries = self.propfind(path, depth).await?;
        let mut this = None;
        let mut members = Vec::with_capacity(entries.len());
        for entry in entries {
            let rel = self.relative(&entry.href);
            if rel == target && this.is_none() {
                this = Some(entry.into_metadata(base_name(&target)));
            } else {
                let name = base_name(&rel).to_string();
                members.push(entry.into_metadata(&name));
            }
        }
        let Some(this) = this else {
            warn!("dav: listing of {} did not include the resource itself", path);
            return Err(StoreError::Protocol {
                reason: format!("listing of {} lacks a self entry", path),
            });
        };
        let mut out = Vec::with_capacity(members.len() + 1);
        out.push(this);
        out.extend(members);
        Ok(out)
    }

    async fn create_collection(&self, path: &str) -> Result<()> {
        let builder = self.request(method("MKCOL"), path);
        self.send(builder, path).await.map_err(mkcol_error)?;
        Ok(())
    }

    async fn move_resource(&self, from: &str, to: &str) -> Result<()> {
        let builder = self
            .request(method("MOVE"), from)
            .header("Destination", self.url_for(to).as_str())
            .header("Overwrite", "T");
        self.send(builder, from).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, path);
        self.send(builder, path).await?;
        Ok(())
    }

    async fn write_whole(&self, path: &str, data: &[u8]) -> Result<bool> {
        self.put(path, data, None).await
    }

    async fn write_range(&self, path: &str, data: &[u8], offset: u64) -> Result<bool> {
        if !data.is_empty() {
            let end = offset + data.len() as u64 - 1;
            return self.put(path, data, Some((offset, end))).await;
        }
        match self.stat(path).await {
            Err(e) if e.is_not_found() => self.put(path, &[], None).await,
            Err(e) => Err(e),
            Ok(meta) if meta.size < offset => {
                self.put(path, &[0], Some((offset - 1, offset - 1))).await?;
                Ok(false)
            }
            Ok(_) => Ok(false),
        }
    }

    async fn read_range(&self, path: &str, offset: u64, len: u32) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let end = offset + len as u64 - 1;
        let builder = self
            .request(Method::GET, path)
            .header(RANGE, format!("bytes={}-{}", offset, end));
        let resp = match self.send(builder, path).await {
            Err(StoreError::Http { status: 416, .. }) => return Ok(Bytes::new()),
            other => other?,
        };
        let partial = resp.status() == StatusCode::PARTIAL_CONTENT;
        let body = resp.bytes().await?;
        if partial {
            return Ok(body);
        }
        // Server ignored the range and sent the whole body.
        let start = (offset as usize).min(body.len());
        let stop = start.saturating_add(len as usize).min(body.len());
        Ok(body.slice(start..stop))
    }
}
