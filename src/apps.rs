//! App configurations
//!
//! An [`AppConfig`] names a workflow specification the server runs as an app.
//! Knowledge items refer to it through the `executable` of their
//! [`crate::App`] entries. Configurations are staged on the
//! [`crate::Session`] and written by the commit pass.

use crate::config::Configuration;
use crate::error::{DsmsError, Result};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;

/// Workflow specification registered under a file name on the server
#[derive(Clone, PartialEq)]
pub struct AppConfig {
    pub name: String,
    pub specification: Value,
    /// Hand the connection settings (never the token) to the app as
    /// workflow parameters
    pub expose_sdk_config: bool,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("name", &self.name)
            .field("metadata", &self.specification.get("metadata"))
            .field("expose_sdk_config", &self.expose_sdk_config)
            .finish()
    }
}

/// Characters that survive form encoding unchanged
fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '~')
}

impl AppConfig {
    pub fn new(name: impl Into<String>, specification: Value) -> Result<Self> {
        let app = Self {
            name: name.into(),
            specification,
            expose_sdk_config: false,
        };
        app.validate()?;
        Ok(app)
    }

    /// Read the specification from a JSON file
    pub fn from_file(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| {
            DsmsError::validation(
                "app.specification",
                format!("cannot read `{}`: {}", path.display(), e),
            )
        })?;
        Self::new(name, serde_json::from_slice(&content)?)
    }

    pub fn with_sdk_config(mut self, expose: bool) -> Result<Self> {
        self.expose_sdk_config = expose;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DsmsError::validation("app.name", "must not be empty"));
        }
        if !self.name.chars().all(is_plain) {
            return Err(DsmsError::validation(
                "app.name",
                format!("`{}` contains invalid characters", self.name),
            ));
        }
        if !self.specification.is_object() {
            return Err(DsmsError::validation(
                "app.specification",
                "must be a mapping",
            ));
        }
        if self.expose_sdk_config && self.parameters().is_none() {
            return Err(DsmsError::validation(
                "app.specification",
                "`spec.arguments.parameters` must be a list to receive the connection settings",
            ));
        }
        Ok(())
    }

    fn parameters(&self) -> Option<&Vec<Value>> {
        self.specification
            .pointer("/spec/arguments/parameters")
            .and_then(Value::as_array)
    }

    /// Definition file uploaded to the server
    ///
    /// JSON is valid YAML, so the specification is sent as JSON text.
    /// Exposed connection settings replace parameters of the same name.
    pub(crate) fn definition(&self, config: &Configuration) -> Result<Vec<u8>> {
        let mut specification = self.specification.clone();
        if self.expose_sdk_config {
            let settings = [
                ("request_timeout", json!(config.request_timeout)),
                ("ping", json!(config.ping_backend)),
                ("host_url", json!(config.host_url)),
                ("ssl_verify", json!(config.ssl_verify)),
                ("kitem_repo", json!(config.kitem_repo)),
            ];
            let Some(parameters) = specification
                .pointer_mut("/spec/arguments/parameters")
                .and_then(Value::as_array_mut)
            else {
                return Err(DsmsError::validation(
                    "app.specification",
                    "`spec.arguments.parameters` must be a list",
                ));
            };
            for (name, value) in settings {
                parameters.retain(|p| p.get("name").and_then(Value::as_str) != Some(name));
                parameters.push(json!({ "name": name, "value": value }));
            }
        }
        Ok(serde_json::to_vec_pretty(&specification)?)
    }

    /// Configuration as stored on the server
    pub(crate) fn from_definition(name: &str, definition: &[u8]) -> Result<Self> {
        Self::new(name, serde_json::from_slice(definition)?)
    }

    pub(crate) fn file_name(&self) -> String {
        format!("{}.yaml", self.name)
    }
}

/// App configuration changes staged for the next commit
#[derive(Debug, Clone, Default)]
pub(crate) struct AppConfigChanges {
    pub(crate) created: Vec<AppConfig>,
    pub(crate) updated: Vec<AppConfig>,
    pub(crate) deleted: Vec<String>,
}

impl AppConfigChanges {
    pub(crate) fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}
