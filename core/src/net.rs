use std::collections::HashMap;
use std::fmt;
use std::io::Read;

use reqwest::blocking::Client;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG,
    LAST_MODIFIED, RANGE,
};

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};

/// Byte range for a `Range` header. `end` is inclusive, as on the wire;
/// `None` asks for everything from `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub range: Option<ByteRange>,
    pub proxy: Option<String>,
    pub basic_auth: Option<(String, String)>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            range: None,
            proxy: None,
            basic_auth: None,
        }
    }

    pub fn with_range(&self, range: Option<ByteRange>) -> Self {
        let mut req = self.clone();
        req.range = range;
        req
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (span, total) = rest.split_once('/')?;
        let (start, end) = span.trim().split_once('-')?;
        let total = match total.trim() {
            "*" => None,
            value => Some(value.parse::<u64>().ok()?),
        };
        Some(Self {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
            total,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    pub accept_ranges: Option<bool>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ResponseMeta {
    fn from_headers(status_code: u16, headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        };
        Self {
            status_code,
            content_length: text(CONTENT_LENGTH).and_then(|value| value.parse::<u64>().ok()),
            content_range: text(CONTENT_RANGE).and_then(|value| ContentRange::parse(&value)),
            accept_ranges: text(ACCEPT_RANGES).map(|value| {
                value
                    .split(',')
                    .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))
            }),
            etag: text(ETAG),
            last_modified: text(LAST_MODIFIED),
        }
    }
}

pub struct DownloadResponse {
    pub meta: ResponseMeta,
    pub body: Box<dyn Read + Send>,
}

impl fmt::Debug for DownloadResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadResponse")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

pub trait NetClient: Send + Sync {
    fn head(&self, req: &DownloadRequest) -> CoreResult<ResponseMeta>;
    fn get(&self, req: &DownloadRequest) -> CoreResult<DownloadResponse>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
    config: EngineConfig,
}

impl ReqwestNetClient {
    pub fn new(config: &EngineConfig) -> CoreResult<Self> {
        let client = build_client(config, None)?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn request_headers(&self, req: &DownloadRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::Network(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CoreError::Network(err.to_string()))?;
            headers.insert(name, value);
        }
        if !req.cookies.is_empty() {
            let cookie_value = req
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<String>>()
                .join("; ");
            headers.insert(
                reqwest::header::COOKIE,
                HeaderValue::from_str(&cookie_value)
                    .map_err(|err| CoreError::Network(err.to_string()))?,
            );
        }
        if let Some(range) = req.range {
            headers.insert(
                RANGE,
                HeaderValue::from_str(&range.header_value())
                    .map_err(|err| CoreError::Network(err.to_string()))?,
            );
        }
        Ok(headers)
    }

    fn pick_client(&self, req: &DownloadRequest) -> CoreResult<Client> {
        if req.proxy.is_some() {
            build_client(&self.config, req.proxy.as_deref())
        } else {
            Ok(self.client.clone())
        }
    }
}

fn build_client(config: &EngineConfig, proxy: Option<&str>) -> CoreResult<Client> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.as_str())
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout);
    if let Some(proxy_url) = proxy {
        let proxy =
            reqwest::Proxy::all(proxy_url).map_err(|err| CoreError::Network(err.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|err| CoreError::Network(err.to_string()))
}

impl NetClient for ReqwestNetClient {
    fn head(&self, req: &DownloadRequest) -> CoreResult<ResponseMeta> {
        let client = self.pick_client(req)?;
        let mut request = client.head(&req.url).headers(self.request_headers(req)?);
        if let Some((user, pass)) = &req.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        let resp = request
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(ResponseMeta::from_headers(resp.status().as_u16(), resp.headers()))
    }

    fn get(&self, req: &DownloadRequest) -> CoreResult<DownloadResponse> {
        let client = self.pick_client(req)?;
        let mut request = client.get(&req.url).headers(self.request_headers(req)?);
        if let Some((user, pass)) = &req.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        let resp = request
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let meta = ResponseMeta::from_headers(resp.status().as_u16(), resp.headers());
        Ok(DownloadResponse {
            meta,
            body: Box::new(resp),
        })
    }
}
