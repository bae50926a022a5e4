//! Remote transport abstraction
//!
//! The SDK core talks to a DSMS instance only through the [`Transport`] trait:
//! one request in, one response out. Retry and re-authentication policy lives
//! entirely inside implementations; the core never retries.

use crate::error::{DsmsError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

#[cfg(feature = "http")]
pub mod http;
pub mod mock;
pub mod routes;

#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use mock::{MockServer, RecordedRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    /// Single-file multipart upload
    Multipart {
        field: String,
        file_name: String,
        bytes: Vec<u8>,
    },
    /// URL-encoded form fields
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Route relative to the host, e.g. `api/knowledge/kitems`
    pub path: String,
    pub body: Option<Body>,
    pub query: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            query: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    pub fn multipart(
        mut self,
        field: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.body = Some(Body::Multipart {
            field: field.into(),
            file_name: file_name.into(),
            bytes,
        });
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(Body::Form(fields));
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// JSON body, if any
    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            Some(Body::Json(value)) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json_value(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a non-success status into the matching error
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(DsmsError::from_status(self.status, self.text()))
        }
    }
}

/// Synchronous request/response seam to a DSMS instance
///
/// A call either yields a response (whatever its status) or fails with
/// [`DsmsError::Transport`] when no response could be obtained.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: Request) -> Result<Response>;
}

/// Issue a request and reject non-success statuses
pub async fn send(transport: &dyn Transport, request: Request) -> Result<Response> {
    transport.call(request).await?.error_for_status()
}
