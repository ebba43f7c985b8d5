//! Single-attempt transfers over HTTP(S) and FTP.
//!
//! A [`Transport`] performs exactly one exchange and classifies failures;
//! retry decisions live in [`crate::executor`] and [`crate::client`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, multipart};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::ftp::FtpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Form(Vec<(String, String)>),
    Multipart(Vec<(String, String)>),
    Json(Value),
    Xml(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post(url: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are stored lowercase.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established before the connect timeout.
    #[error("connect timed out: {0}")]
    ConnectTimeout(String),
    /// DNS failure or connection refused; retrying will not help.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    /// The connection was live and the transfer broke; never retried.
    #[error("transfer failed: {0}")]
    Io(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: &HttpRequest,
        connect_timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

/// reqwest for `http`/`https`, a passive-mode client for `ftp`.
pub struct DefaultTransport {
    request_timeout: Duration,
    clients: Mutex<HashMap<Duration, Client>>,
}

impl fmt::Debug for DefaultTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTransport")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl DefaultTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, connect_timeout: Duration) -> Result<Client, TransportError> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&connect_timeout) {
            return Ok(client.clone());
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("xref-fetch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| TransportError::Invalid(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .map_err(|err| TransportError::Invalid(err.to_string()))?;
        clients.insert(connect_timeout, client.clone());
        Ok(client)
    }

    fn send_http(
        &self,
        request: &HttpRequest,
        connect_timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let client = self.client_for(connect_timeout)?;
        let mut builder = match request.method {
            Method::Get => client.get(&request.url),
            Method::Post => client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = attach_body(builder, &request.body);

        let response = builder.send().map_err(classify_reqwest)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .map_err(|err| TransportError::Io(err.to_string()))?
            .to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for DefaultTransport {
    fn send(
        &self,
        request: &HttpRequest,
        connect_timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let url = Url::parse(&request.url)
            .map_err(|err| TransportError::Invalid(format!("{}: {err}", request.url)))?;
        match url.scheme() {
            "http" | "https" => self.send_http(request, connect_timeout),
            "ftp" => FtpClient::new(connect_timeout, self.request_timeout).retrieve(&url),
            other => Err(TransportError::Invalid(format!(
                "unsupported scheme {other} in {}",
                request.url
            ))),
        }
    }
}

fn attach_body(builder: RequestBuilder, body: &RequestBody) -> RequestBuilder {
    match body {
        RequestBody::Empty => builder,
        RequestBody::Form(pairs) => builder.form(pairs),
        RequestBody::Multipart(fields) => {
            let form = fields
                .iter()
                .fold(multipart::Form::new(), |form, (name, value)| {
                    form.text(name.clone(), value.clone())
                });
            builder.multipart(form)
        }
        RequestBody::Json(value) => builder.json(value),
        RequestBody::Xml(text) => builder
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(text.clone()),
    }
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_builder() {
        return TransportError::Invalid(err.to_string());
    }
    if err.is_connect() {
        if err.is_timeout() {
            return TransportError::ConnectTimeout(err.to_string());
        }
        return TransportError::HostUnreachable(err.to_string());
    }
    TransportError::Io(err.to_string())
}
