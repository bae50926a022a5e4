//! Sub-object records held in the list slots of a knowledge item
//!
//! Each record validates its own shape and names its natural key. Two records
//! with the same key describe the same sub-object; the tracked list uses the
//! key for deduplication and deletion, and full equality to detect changes.

use crate::error::{DsmsError, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use uuid::Uuid;

/// A record that can live in a [`super::tracked::TrackedList`]
pub trait PropertyItem: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned {
    type Key: Clone + Eq + Ord + fmt::Debug + fmt::Display;

    /// Name of the slot, used in error messages
    const SLOT: &'static str;

    fn key(&self) -> Self::Key;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Extra checks for a record the server does not hold yet
    fn validate_addition(&self) -> Result<()> {
        Ok(())
    }

    /// Reason why `self` cannot sit in the same slot as `other`, whose key differs
    fn conflict(&self, _other: &Self) -> Option<String> {
        None
    }
}

fn require_non_empty(slot: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DsmsError::validation(
            format!("{}.{}", slot, field),
            "must not be empty",
        ));
    }
    Ok(())
}

fn require_max_len(slot: &str, field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(DsmsError::validation(
            format!("{}.{}", slot, field),
            format!("must be at most {} characters", max),
        ));
    }
    Ok(())
}

fn matches(pattern: &'static OnceLock<Option<Regex>>, source: &str, value: &str) -> bool {
    pattern
        .get_or_init(|| Regex::new(source).ok())
        .as_ref()
        .map_or(false, |re| re.is_match(value))
}

fn is_url(value: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&PATTERN, r"^[a-zA-Z][a-zA-Z0-9+.\-]*://[^\s/?#]+[^\s]*$", value)
}

fn is_email(value: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&PATTERN, r"^[^@\s]+@[^@\s]+\.[^@\s]+$", value)
}

/// File attached to a knowledge item
///
/// Only the name travels in the item payload. Content is either held inline
/// or read from `source` when the upload stage runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Attachment {
    /// Attachment already known to the server; it cannot be added as new
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: None,
            source: None,
        }
    }

    pub fn from_bytes(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: Some(content.into()),
            source: None,
        }
    }

    /// Attachment read from a local file at upload time
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DsmsError::validation("attachments.source", "path has no file name"))?;
        if !path.is_file() {
            return Err(DsmsError::validation(
                "attachments.source",
                format!("`{}` is not a readable file", path.display()),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            content: None,
            source: Some(path.to_path_buf()),
        })
    }

    /// Bytes to upload, if this attachment carries any
    pub async fn payload(&self) -> Result<Option<Vec<u8>>> {
        if let Some(content) = &self.content {
            return Ok(Some(content.clone()));
        }
        match &self.source {
            Some(path) => tokio::fs::read(path)
                .await
                .map(Some)
                .map_err(|e| DsmsError::validation("attachments.source", e.to_string())),
            None => Ok(None),
        }
    }
}

impl PropertyItem for Attachment {
    type Key = String;
    const SLOT: &'static str = "attachments";

    fn key(&self) -> String {
        self.name.clone()
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::SLOT, "name", &self.name)?;
        if self.name.contains('/') || self.name.contains('\\') {
            return Err(DsmsError::validation(
                "attachments.name",
                "must be a plain file name",
            ));
        }
        Ok(())
    }

    fn validate_addition(&self) -> Result<()> {
        if self.content.is_none() && self.source.is_none() {
            return Err(DsmsError::validation(
                "attachments",
                format!("`{}` has neither content nor a source file", self.name),
            ));
        }
        Ok(())
    }
}

/// Semantic annotation of a knowledge item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub iri: String,
    #[serde(alias = "name")]
    pub label: String,
    pub namespace: String,
}

impl Annotation {
    pub fn new(iri: impl Into<String>, label: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            iri: iri.into(),
            label: label.into(),
            namespace: namespace.into(),
        }
    }

    /// Split an IRI at its last `#` or `/` into namespace and label
    pub fn from_iri(iri: impl Into<String>) -> Self {
        let iri = iri.into();
        let split = iri.rfind('#').or_else(|| iri.rfind('/'));
        let (namespace, label) = match split {
            Some(index) if index + 1 < iri.len() => (iri[..index].to_string(), iri[index + 1..].to_string()),
            _ => (iri.clone(), iri.clone()),
        };
        Self {
            iri,
            label,
            namespace,
        }
    }
}

impl PropertyItem for Annotation {
    type Key = String;
    const SLOT: &'static str = "annotations";

    fn key(&self) -> String {
        self.iri.clone()
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::SLOT, "iri", &self.iri)?;
        require_max_len(Self::SLOT, "iri", &self.iri, 200)?;
        require_max_len(Self::SLOT, "label", &self.label, 100)?;
        require_max_len(Self::SLOT, "namespace", &self.namespace, 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub label: String,
    pub url: String,
}

impl ExternalLink {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

impl PropertyItem for ExternalLink {
    type Key = String;
    const SLOT: &'static str = "external_links";

    fn key(&self) -> String {
        self.url.clone()
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::SLOT, "label", &self.label)?;
        if !is_url(&self.url) {
            return Err(DsmsError::validation(
                "external_links.url",
                format!("`{}` is not an absolute URL", self.url),
            ));
        }
        Ok(())
    }

    /// Links travel as a label to url map
    fn conflict(&self, other: &Self) -> Option<String> {
        (self.label == other.label)
            .then(|| format!("label `{}` is already used by `{}`", self.label, other.url))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl Contact {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            user_id: None,
        }
    }
}

impl PropertyItem for Contact {
    type Key = String;
    const SLOT: &'static str = "contacts";

    fn key(&self) -> String {
        self.email.to_lowercase()
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::SLOT, "name", &self.name)?;
        if !is_email(&self.email) {
            return Err(DsmsError::validation(
                "contacts.email",
                format!("`{}` is not an email address", self.email),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affiliation {
    pub name: String,
}

impl Affiliation {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PropertyItem for Affiliation {
    type Key = String;
    const SLOT: &'static str = "affiliations";

    fn key(&self) -> String {
        self.name.clone()
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::SLOT, "name", &self.name)
    }
}

/// Grant of access to a user group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroup {
    pub name: String,
    pub group_id: String,
}

impl UserGroup {
    pub fn new(name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_id: group_id.into(),
        }
    }
}

impl PropertyItem for UserGroup {
    type Key = String;
    const SLOT: &'static str = "user_groups";

    fn key(&self) -> String {
        self.group_id.clone()
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::SLOT, "group_id", &self.group_id)
    }
}

/// Reference from one knowledge item to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedKItem {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
}

impl LinkedKItem {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            source_id: None,
        }
    }
}

impl PropertyItem for LinkedKItem {
    type Key = Uuid;
    const SLOT: &'static str = "linked_kitems";

    fn key(&self) -> Uuid {
        self.id
    }
}

/// Options of an app bound to a knowledge item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppProperties {
    #[serde(default)]
    pub trigger_upon_upload: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_upon_upload_file_extensions: Option<Vec<String>>,
}

/// App configuration attached to a knowledge item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub executable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<AppProperties>,
    /// Server-side id, never sent back
    #[serde(default, skip_serializing)]
    pub kitem_app_id: Option<i64>,
}

impl App {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            title: None,
            description: None,
            tags: None,
            additional_properties: None,
            kitem_app_id: None,
        }
    }
}

impl PropertyItem for App {
    type Key = String;
    const SLOT: &'static str = "kitem_apps";

    fn key(&self) -> String {
        self.executable.clone()
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::SLOT, "executable", &self.executable)
    }
}

/// One named column of the tabular data of a knowledge item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

impl PropertyItem for Column {
    type Key = String;
    const SLOT: &'static str = "dataframe";

    fn key(&self) -> String {
        self.name.clone()
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::SLOT, "name", &self.name)?;
        if self
            .values
            .iter()
            .any(|v| v.is_object() || v.is_array())
        {
            return Err(DsmsError::validation(
                format!("dataframe.{}", self.name),
                "column values must be scalars",
            ));
        }
        Ok(())
    }
}
