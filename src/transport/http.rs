//! reqwest-backed transport

use super::{routes, Body, Method, Request, Response, Transport};
use crate::config::configuration::normalize_bearer;
use crate::config::Configuration;
use crate::error::{DsmsError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// HTTP transport for a live DSMS instance
pub struct HttpTransport {
    config: Configuration,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Build the client and obtain a token when only credentials were given
    pub async fn connect(config: Configuration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .danger_accept_invalid_certs(!config.ssl_verify)
            .build()
            .map_err(|e| DsmsError::Transport(e.to_string()))?;

        let transport = Self {
            token: RwLock::new(config.bearer()),
            config,
            client,
        };

        if transport.token.read().await.is_none() && transport.has_credentials() {
            let token = transport.exchange_token().await?;
            *transport.token.write().await = Some(token);
        }

        Ok(transport)
    }

    fn has_credentials(&self) -> bool {
        self.config.username.is_some() && self.config.password.is_some()
    }

    /// Trade username and password for a bearer token
    async fn exchange_token(&self) -> Result<String> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            return Err(DsmsError::validation(
                "credentials",
                "username and password are required to fetch a token",
            ));
        };

        let authorization = format!("Basic {}:{}", username, password);
        let response = self
            .send(&Request::get(routes::TOKEN), Some(&authorization))
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json()?;
        let token = body
            .get("token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| DsmsError::Transport("token response carried no token".to_string()))?;
        debug!("Fetched access token for {}", username);
        Ok(normalize_bearer(token))
    }

    async fn send(&self, request: &Request, authorization: Option<&str>) -> Result<Response> {
        let url = self.config.endpoint(&request.path);
        debug!("{} {}", request.method, url);

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(authorization) = authorization {
            builder = builder.header(reqwest::header::AUTHORIZATION, authorization);
        }
        builder = match &request.body {
            Some(Body::Json(value)) => builder.json(value),
            Some(Body::Multipart {
                field,
                file_name,
                bytes,
            }) => {
                let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
                builder.multipart(reqwest::multipart::Form::new().part(field.clone(), part))
            }
            Some(Body::Form(fields)) => builder.form(fields),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| DsmsError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| DsmsError::Transport(e.to_string()))?;
        debug!("{} {} -> {}", request.method, request.path, status);

        Ok(Response::new(status, body.to_vec()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, request: Request) -> Result<Response> {
        let token = self.token.read().await.clone();
        let response = self.send(&request, token.as_deref()).await?;

        if response.status == 401 && self.config.enable_auto_reauth && self.has_credentials() {
            debug!("Token rejected, re-authenticating");
            let token = self.exchange_token().await?;
            *self.token.write().await = Some(token.clone());
            return self.send(&request, Some(&token)).await;
        }

        Ok(response)
    }
}
