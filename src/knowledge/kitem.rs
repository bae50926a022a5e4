//! Knowledge item aggregate
//!
//! A [`KItem`] owns its scalar fields, one [`TrackedList`] per list slot and
//! the custom property mapping. Mutations go through the slot wrappers and
//! are validated before anything changes. The only way an item becomes clean
//! is a confirmation from the commit engine or [`KItem::apply_server_snapshot`].

use super::custom_properties::{CustomProperties, TrackedProperties};
use super::patch::KItemPatch;
use super::properties::{
    Affiliation, Annotation, App, Attachment, Column, Contact, ExternalLink, LinkedKItem,
    UserGroup,
};
use super::timestamp;
use super::tracked::TrackedList;
use crate::error::{DsmsError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use uuid::Uuid;

const MIN_SLUG_LEN: usize = 4;

/// Turn arbitrary text into a slug: drop everything but word characters,
/// whitespace and dashes, then drop whitespace and lowercase
pub fn slugify(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn validate_slug(slug: &str) -> Result<()> {
    let slugified = slugify(slug);
    if slugified.chars().count() < MIN_SLUG_LEN {
        return Err(DsmsError::validation(
            "slug",
            format!("must have a minimum length of {}", MIN_SLUG_LEN),
        ));
    }
    if slug != slugified {
        return Err(DsmsError::validation(
            "slug",
            format!("`{}` is not a valid slug, a valid variation would be `{}`", slug, slugified),
        ));
    }
    Ok(())
}

/// Lifecycle position of an item within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Never created on the server
    Unsaved,
    Clean,
    Dirty,
    /// Staged for deletion on the next commit
    PendingDeletion,
}

/// Scalar fields compared against the last synced values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scalars {
    pub name: String,
    pub slug: Option<String>,
    pub summary: Option<String>,
    pub ktype_id: String,
}

/// Image staged as the item's new avatar
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl AvatarUpload {
    fn mime_type(&self) -> &'static str {
        let extension = self
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "svg" => "image/svg+xml",
            _ => "application/octet-stream",
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), STANDARD.encode(&self.bytes))
    }

    /// Body of the avatar upload request
    pub fn to_wire(&self) -> Value {
        let image = self.data_url();
        json!({
            "croppedImage": image,
            "originalImage": image,
            "filename": self.file_name,
        })
    }
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Server representation of a knowledge item
#[derive(Debug, Deserialize)]
struct Snapshot {
    id: Uuid,
    name: String,
    #[serde(default)]
    slug: Option<String>,
    ktype_id: String,
    #[serde(default)]
    summary: Value,
    #[serde(default, deserialize_with = "nullable")]
    annotations: Vec<Annotation>,
    #[serde(default, deserialize_with = "nullable")]
    attachments: Vec<Attachment>,
    #[serde(default, deserialize_with = "nullable")]
    linked_kitems: Vec<LinkedKItem>,
    #[serde(default, deserialize_with = "nullable")]
    affiliations: Vec<Affiliation>,
    #[serde(default, deserialize_with = "nullable")]
    contacts: Vec<Contact>,
    #[serde(default, deserialize_with = "nullable")]
    external_links: Vec<ExternalLink>,
    #[serde(default, deserialize_with = "nullable")]
    user_groups: Vec<UserGroup>,
    #[serde(default, deserialize_with = "nullable")]
    kitem_apps: Vec<App>,
    #[serde(default)]
    custom_properties: Value,
    #[serde(default, deserialize_with = "nullable")]
    avatar_exists: bool,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    updated_at: Option<DateTime<Utc>>,
}

fn summary_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map.get("text").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KItem {
    id: Option<Uuid>,
    scalars: Scalars,
    baseline: Option<Scalars>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    avatar_exists: bool,
    annotations: TrackedList<Annotation>,
    attachments: TrackedList<Attachment>,
    linked_kitems: TrackedList<LinkedKItem>,
    affiliations: TrackedList<Affiliation>,
    contacts: TrackedList<Contact>,
    external_links: TrackedList<ExternalLink>,
    user_groups: TrackedList<UserGroup>,
    kitem_apps: TrackedList<App>,
    dataframe: TrackedList<Column>,
    /// The dataframe slot mirrors the server's table
    dataframe_loaded: bool,
    custom_properties: TrackedProperties,
    avatar: Option<AvatarUpload>,
}

impl KItem {
    /// New local item of knowledge type `ktype_id`
    pub fn new(name: impl Into<String>, ktype_id: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let ktype_id = ktype_id.into();
        if name.trim().is_empty() {
            return Err(DsmsError::validation("name", "must not be empty"));
        }
        if ktype_id.trim().is_empty() {
            return Err(DsmsError::validation("ktype_id", "must not be empty"));
        }
        Ok(Self {
            id: None,
            scalars: Scalars {
                name,
                slug: None,
                summary: None,
                ktype_id,
            },
            baseline: None,
            created_at: None,
            updated_at: None,
            avatar_exists: false,
            annotations: TrackedList::new(),
            attachments: TrackedList::new(),
            linked_kitems: TrackedList::new(),
            affiliations: TrackedList::new(),
            contacts: TrackedList::new(),
            external_links: TrackedList::new(),
            user_groups: TrackedList::new(),
            kitem_apps: TrackedList::new(),
            dataframe: TrackedList::new(),
            dataframe_loaded: true,
            custom_properties: TrackedProperties::default(),
            avatar: None,
        })
    }

    /// Clean item built from a server payload
    pub fn from_snapshot(data: &Value) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_value(data.clone())?;
        let custom_properties = CustomProperties::from_wire(&snapshot.custom_properties)?;
        let scalars = Scalars {
            name: snapshot.name,
            slug: snapshot.slug,
            summary: summary_text(&snapshot.summary),
            ktype_id: snapshot.ktype_id,
        };
        Ok(Self {
            id: Some(snapshot.id),
            baseline: Some(scalars.clone()),
            scalars,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            avatar_exists: snapshot.avatar_exists,
            annotations: TrackedList::synced(snapshot.annotations),
            attachments: TrackedList::synced(snapshot.attachments),
            linked_kitems: TrackedList::synced(snapshot.linked_kitems),
            affiliations: TrackedList::synced(snapshot.affiliations),
            contacts: TrackedList::synced(snapshot.contacts),
            external_links: TrackedList::synced(snapshot.external_links),
            user_groups: TrackedList::synced(snapshot.user_groups),
            kitem_apps: TrackedList::synced(snapshot.kitem_apps),
            dataframe: TrackedList::new(),
            dataframe_loaded: false,
            custom_properties: TrackedProperties::synced(custom_properties),
            avatar: None,
        })
    }

    /// Overwrite every field from an authoritative server payload
    ///
    /// The payload is parsed completely before anything changes. A payload
    /// carrying a different identity is rejected. Tabular data is not part of
    /// the item payload; the local columns and their loaded state are kept.
    pub fn apply_server_snapshot(&mut self, data: &Value) -> Result<()> {
        let fresh = Self::from_snapshot(data)?;
        if let (Some(current), Some(incoming)) = (self.id, fresh.id) {
            if current != incoming {
                return Err(DsmsError::validation(
                    "id",
                    format!("snapshot of `{}` cannot be applied to `{}`", incoming, current),
                ));
            }
        }

        let Self {
            id,
            scalars,
            baseline,
            created_at,
            updated_at,
            avatar_exists,
            annotations,
            attachments,
            linked_kitems,
            affiliations,
            contacts,
            external_links,
            user_groups,
            kitem_apps,
            custom_properties,
            ..
        } = fresh;

        self.id = id;
        self.scalars = scalars;
        self.baseline = baseline;
        self.created_at = created_at;
        self.updated_at = updated_at;
        self.avatar_exists = avatar_exists;
        self.annotations = annotations;
        self.attachments = attachments;
        self.linked_kitems = linked_kitems;
        self.affiliations = affiliations;
        self.contacts = contacts;
        self.external_links = external_links;
        self.user_groups = user_groups;
        self.kitem_apps = kitem_apps;
        self.custom_properties.adopt(custom_properties.content().clone());
        self.dataframe.mark_synced();
        self.avatar = None;
        Ok(())
    }

    pub fn id(&self) -> Option<Uuid> {
        self.id
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn name(&self) -> &str {
        &self.scalars.name
    }

    pub fn slug(&self) -> Option<&str> {
        self.scalars.slug.as_deref()
    }

    pub fn summary(&self) -> Option<&str> {
        self.scalars.summary.as_deref()
    }

    pub fn ktype_id(&self) -> &str {
        &self.scalars.ktype_id
    }

    pub fn scalars(&self) -> &Scalars {
        &self.scalars
    }

    /// Scalars as last confirmed by the server
    pub fn synced_scalars(&self) -> Option<&Scalars> {
        self.baseline.as_ref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn avatar_exists(&self) -> bool {
        self.avatar_exists
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DsmsError::validation("name", "must not be empty"));
        }
        self.scalars.name = name;
        Ok(())
    }

    pub fn set_slug(&mut self, slug: impl Into<String>) -> Result<()> {
        let slug = slug.into();
        validate_slug(&slug)?;
        self.scalars.slug = Some(slug);
        Ok(())
    }

    pub fn set_summary(&mut self, summary: Option<String>) {
        self.scalars.summary = summary;
    }

    /// Change the knowledge type; only possible before the first commit
    pub fn set_ktype(&mut self, ktype_id: impl Into<String>) -> Result<()> {
        if self.id.is_some() {
            return Err(DsmsError::validation(
                "ktype_id",
                "the knowledge type of a created item is fixed",
            ));
        }
        let ktype_id = ktype_id.into();
        if ktype_id.trim().is_empty() {
            return Err(DsmsError::validation("ktype_id", "must not be empty"));
        }
        self.scalars.ktype_id = ktype_id;
        Ok(())
    }

    /// Derive the slug from the name when none was set, then validate it
    pub fn finalize_slug(&mut self, individual: bool) -> Result<()> {
        let slug = match &self.scalars.slug {
            Some(slug) => slug.clone(),
            None => {
                let base = slugify(&self.scalars.name);
                if individual {
                    let suffix = Uuid::new_v4().simple().to_string();
                    format!("{}-{}", base, &suffix[..8])
                } else {
                    base
                }
            }
        };
        validate_slug(&slug)?;
        self.scalars.slug = Some(slug);
        Ok(())
    }

    /// Stage a new avatar image
    pub fn set_avatar(&mut self, bytes: impl Into<Vec<u8>>, file_name: impl Into<String>) -> Result<()> {
        let bytes = bytes.into();
        let file_name = file_name.into();
        if bytes.is_empty() {
            return Err(DsmsError::validation("avatar", "image must not be empty"));
        }
        if file_name.trim().is_empty() {
            return Err(DsmsError::validation("avatar", "file name must not be empty"));
        }
        self.avatar = Some(AvatarUpload { file_name, bytes });
        Ok(())
    }

    pub fn pending_avatar(&self) -> Option<&AvatarUpload> {
        self.avatar.as_ref()
    }

    pub fn annotations(&self) -> &TrackedList<Annotation> {
        &self.annotations
    }

    pub fn annotations_mut(&mut self) -> &mut TrackedList<Annotation> {
        &mut self.annotations
    }

    pub fn attachments(&self) -> &TrackedList<Attachment> {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut TrackedList<Attachment> {
        &mut self.attachments
    }

    pub fn linked_kitems(&self) -> &TrackedList<LinkedKItem> {
        &self.linked_kitems
    }

    pub fn linked_kitems_mut(&mut self) -> &mut TrackedList<LinkedKItem> {
        &mut self.linked_kitems
    }

    pub fn affiliations(&self) -> &TrackedList<Affiliation> {
        &self.affiliations
    }

    pub fn affiliations_mut(&mut self) -> &mut TrackedList<Affiliation> {
        &mut self.affiliations
    }

    pub fn contacts(&self) -> &TrackedList<Contact> {
        &self.contacts
    }

    pub fn contacts_mut(&mut self) -> &mut TrackedList<Contact> {
        &mut self.contacts
    }

    pub fn external_links(&self) -> &TrackedList<ExternalLink> {
        &self.external_links
    }

    pub fn external_links_mut(&mut self) -> &mut TrackedList<ExternalLink> {
        &mut self.external_links
    }

    pub fn user_groups(&self) -> &TrackedList<UserGroup> {
        &self.user_groups
    }

    pub fn user_groups_mut(&mut self) -> &mut TrackedList<UserGroup> {
        &mut self.user_groups
    }

    pub fn kitem_apps(&self) -> &TrackedList<App> {
        &self.kitem_apps
    }

    pub fn kitem_apps_mut(&mut self) -> &mut TrackedList<App> {
        &mut self.kitem_apps
    }

    pub fn dataframe(&self) -> &TrackedList<Column> {
        &self.dataframe
    }

    /// Whether the dataframe slot holds the server's table. Items read from
    /// the server start unloaded; see [`crate::Session::fetch_dataframe`].
    pub fn dataframe_loaded(&self) -> bool {
        self.dataframe_loaded
    }

    /// Tabular data for editing; refused until the server's table was loaded,
    /// since every upload replaces the whole table
    pub fn dataframe_mut(&mut self) -> Result<&mut TrackedList<Column>> {
        if !self.dataframe_loaded {
            return Err(DsmsError::validation(
                "dataframe",
                format!("the table of `{}` has not been fetched yet", self.scalars.name),
            ));
        }
        Ok(&mut self.dataframe)
    }

    /// Take `columns` as the server's current table, dropping local edits
    pub(crate) fn load_dataframe(&mut self, columns: Vec<Column>) -> Result<()> {
        let mut dataframe = TrackedList::new();
        dataframe.assign(columns)?;
        dataframe.mark_synced();
        self.dataframe = dataframe;
        self.dataframe_loaded = true;
        Ok(())
    }

    pub(crate) fn confirm_dataframe(&mut self) {
        self.dataframe.mark_synced();
    }

    pub fn custom_properties(&self) -> &TrackedProperties {
        &self.custom_properties
    }

    pub fn custom_properties_mut(&mut self) -> &mut TrackedProperties {
        &mut self.custom_properties
    }

    pub fn is_dirty(&self) -> bool {
        self.id.is_none() || !self.diff().is_empty()
    }

    /// Everything that changed since the last sync
    pub fn diff(&self) -> KItemPatch {
        KItemPatch::of(self)
    }

    /// Discard every local change
    pub fn reset(&mut self) {
        if let Some(baseline) = &self.baseline {
            self.scalars = baseline.clone();
        }
        self.annotations.reset();
        self.attachments.reset();
        self.linked_kitems.reset();
        self.affiliations.reset();
        self.contacts.reset();
        self.external_links.reset();
        self.user_groups.reset();
        self.kitem_apps.reset();
        self.dataframe.reset();
        self.custom_properties.reset();
        self.avatar = None;
    }

    /// Take identity and timestamps from a create or update response
    pub(crate) fn record_server_fields(&mut self, response: &Value) -> Result<()> {
        let incoming = response
            .get("id")
            .and_then(Value::as_str)
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| DsmsError::validation("id", e.to_string()))?;
        match (self.id, incoming) {
            (None, Some(id)) => self.id = Some(id),
            (None, None) => {
                return Err(DsmsError::validation("id", "server response carried no identity"))
            }
            (Some(current), Some(id)) if current != id => {
                return Err(DsmsError::validation(
                    "id",
                    format!("server answered for `{}` instead of `{}`", id, current),
                ))
            }
            _ => {}
        }
        for (field, target) in [
            ("created_at", &mut self.created_at),
            ("updated_at", &mut self.updated_at),
        ] {
            if let Some(instant) = response.get(field).and_then(Value::as_str).and_then(timestamp::parse) {
                *target = Some(instant);
            }
        }
        Ok(())
    }

    /// The server accepted the scalars and every slot sent in the item payload
    pub(crate) fn confirm_structure(&mut self) {
        self.baseline = Some(self.scalars.clone());
        self.annotations.mark_synced();
        self.linked_kitems.mark_synced();
        self.affiliations.mark_synced();
        self.contacts.mark_synced();
        self.external_links.mark_synced();
        self.user_groups.mark_synced();
        self.kitem_apps.mark_synced();
        self.custom_properties.mark_synced();
    }

    pub(crate) fn confirm_avatar(&mut self) {
        self.avatar = None;
        self.avatar_exists = true;
    }
}
