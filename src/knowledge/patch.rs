//! Diff of a knowledge item and the request bodies built from it

use super::custom_properties::MappingDiff;
use super::kitem::KItem;
use super::properties::{
    Affiliation, Annotation, App, Attachment, Column, Contact, ExternalLink, LinkedKItem,
    PropertyItem, UserGroup,
};
use super::tracked::TrackedList;
use crate::error::Result;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Net additions and deletions of one list slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotDiff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
}

impl<T> Default for SlotDiff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<T: PropertyItem> SlotDiff<T> {
    pub fn of(list: &TrackedList<T>) -> Self {
        Self {
            added: list.pending_additions(),
            removed: list.pending_deletions(),
        }
    }
}

impl<T> SlotDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Everything that changed on an item since its last sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KItemPatch {
    /// Changed scalar fields by wire name
    pub scalars: Map<String, Value>,
    pub annotations: SlotDiff<Annotation>,
    pub attachments: SlotDiff<Attachment>,
    pub linked_kitems: SlotDiff<LinkedKItem>,
    pub affiliations: SlotDiff<Affiliation>,
    pub contacts: SlotDiff<Contact>,
    pub external_links: SlotDiff<ExternalLink>,
    pub user_groups: SlotDiff<UserGroup>,
    pub kitem_apps: SlotDiff<App>,
    pub dataframe: SlotDiff<Column>,
    pub custom_properties: MappingDiff,
    /// A new avatar image is staged
    pub avatar: bool,
}

impl KItemPatch {
    pub fn of(kitem: &KItem) -> Self {
        let current = kitem.scalars();
        let synced = kitem.synced_scalars();
        let mut scalars = Map::new();

        if synced.map(|s| &s.name) != Some(&current.name) {
            scalars.insert("name".to_string(), json!(current.name));
        }
        if synced.map(|s| &s.slug) != Some(&current.slug) {
            scalars.insert("slug".to_string(), json!(current.slug));
        }
        if synced.map(|s| &s.summary) != Some(&current.summary) {
            scalars.insert("summary".to_string(), json!(current.summary));
        }

        Self {
            scalars,
            annotations: SlotDiff::of(kitem.annotations()),
            attachments: SlotDiff::of(kitem.attachments()),
            linked_kitems: SlotDiff::of(kitem.linked_kitems()),
            affiliations: SlotDiff::of(kitem.affiliations()),
            contacts: SlotDiff::of(kitem.contacts()),
            external_links: SlotDiff::of(kitem.external_links()),
            user_groups: SlotDiff::of(kitem.user_groups()),
            kitem_apps: SlotDiff::of(kitem.kitem_apps()),
            dataframe: SlotDiff::of(kitem.dataframe()),
            custom_properties: kitem.custom_properties().diff(),
            avatar: kitem.pending_avatar().is_some(),
        }
    }

    /// Changes carried by the item update request itself
    pub fn has_structural_changes(&self) -> bool {
        !self.scalars.is_empty()
            || !self.annotations.is_empty()
            || !self.linked_kitems.is_empty()
            || !self.affiliations.is_empty()
            || !self.contacts.is_empty()
            || !self.external_links.is_empty()
            || !self.user_groups.is_empty()
            || !self.kitem_apps.is_empty()
            || !self.custom_properties.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_structural_changes()
            && self.attachments.is_empty()
            && self.dataframe.is_empty()
            && !self.avatar
    }
}

fn to_values<T: Serialize>(items: &[T]) -> Result<Value> {
    Ok(serde_json::to_value(items)?)
}

fn link_refs(items: &[LinkedKItem]) -> Value {
    Value::Array(items.iter().map(|link| json!({ "id": link.id })).collect())
}

fn link_map<'a>(links: impl IntoIterator<Item = &'a ExternalLink>) -> Value {
    Value::Object(
        links
            .into_iter()
            .map(|link| (link.label.clone(), json!(link.url)))
            .collect(),
    )
}

/// Body of the create request: the complete item without identity
pub fn create_payload(kitem: &KItem) -> Result<Value> {
    let mut body = json!({
        "name": kitem.name(),
        "slug": kitem.slug(),
        "ktype_id": kitem.ktype_id(),
        "summary": kitem.summary(),
        "annotations": to_values(kitem.annotations().items())?,
        "linked_kitems": link_refs(kitem.linked_kitems().items()),
        "affiliations": to_values(kitem.affiliations().items())?,
        "contacts": to_values(kitem.contacts().items())?,
        "external_links": link_map(kitem.external_links()),
        "user_groups": to_values(kitem.user_groups().items())?,
        "kitem_apps": to_values(kitem.kitem_apps().items())?,
    });
    if !kitem.custom_properties().content().is_empty() {
        body["custom_properties"] = kitem.custom_properties().to_wire()?;
    }
    Ok(body)
}

/// Body of the update request: changed scalars plus the net slot changes
///
/// Annotations, user groups, links and apps travel as add/remove sets.
/// Affiliations, contacts, external links and custom properties are replaced
/// as a whole on the server and are sent in full when they changed.
pub fn update_payload(kitem: &KItem, patch: &KItemPatch) -> Result<Value> {
    let mut body = Map::new();
    body.extend(patch.scalars.clone());

    let mut pair = |add: &str, remove: &str, added: Value, removed: Value| {
        let non_empty = |v: &Value| v.as_array().map_or(false, |a| !a.is_empty());
        if non_empty(&added) {
            body.insert(add.to_string(), added);
        }
        if non_empty(&removed) {
            body.insert(remove.to_string(), removed);
        }
    };
    pair(
        "annotations_to_link",
        "annotations_to_unlink",
        to_values(&patch.annotations.added)?,
        to_values(&patch.annotations.removed)?,
    );
    pair(
        "user_groups_to_add",
        "user_groups_to_remove",
        to_values(&patch.user_groups.added)?,
        to_values(&patch.user_groups.removed)?,
    );
    pair(
        "kitems_to_link",
        "kitems_to_unlink",
        link_refs(&patch.linked_kitems.added),
        link_refs(&patch.linked_kitems.removed),
    );
    pair(
        "kitem_apps_to_update",
        "kitem_apps_to_remove",
        to_values(&patch.kitem_apps.added)?,
        to_values(&patch.kitem_apps.removed)?,
    );

    if !patch.affiliations.is_empty() {
        body.insert("affiliations".to_string(), to_values(kitem.affiliations().items())?);
    }
    if !patch.contacts.is_empty() {
        body.insert("contacts".to_string(), to_values(kitem.contacts().items())?);
    }
    if !patch.external_links.is_empty() {
        body.insert("external_links".to_string(), link_map(kitem.external_links()));
    }
    if !patch.custom_properties.is_empty() {
        body.insert("custom_properties".to_string(), kitem.custom_properties().to_wire()?);
    }

    Ok(Value::Object(body))
}

/// Upload body for the tabular data: `{column: [values]}`
pub fn dataframe_document(kitem: &KItem) -> Result<Vec<u8>> {
    let document: Map<String, Value> = kitem
        .dataframe()
        .iter()
        .map(|column| (column.name.clone(), Value::Array(column.values.clone())))
        .collect();
    Ok(serde_json::to_vec(&document)?)
}
