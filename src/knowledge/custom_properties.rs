//! Custom properties of a knowledge item
//!
//! The server stores custom properties as webform sections holding labelled
//! entries; older items and hand-built ones may carry a flat label→value map.
//! [`CustomProperties`] keeps whichever shape was received and offers a flat
//! view over both. [`TrackedProperties`] adds the baseline, the type schema
//! and the diff.

use super::webform::{id_generator, MeasurementUnit, Webform, Widget};
use crate::error::{DsmsError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Section name for labels the webform does not declare
pub const GENERAL_SECTION: &str = "General";
/// Section name used when the item has no webform at all
pub const MISC_SECTION: &str = "Misc";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(default = "entry_id")]
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_unit: Option<MeasurementUnit>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub widget: Option<Widget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_mapping: Option<Value>,
}

fn entry_id() -> String {
    id_generator("id")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default = "entry_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

/// Custom property content in the shape it was received
#[derive(Debug, Clone, PartialEq)]
pub enum CustomProperties {
    Structured(Vec<Section>),
    Flat(Map<String, Value>),
}

impl Default for CustomProperties {
    fn default() -> Self {
        CustomProperties::Flat(Map::new())
    }
}

impl CustomProperties {
    /// Read either a `{"content": ...}` wrapper, a `{"sections": [...]}`
    /// document or a flat object
    pub fn from_wire(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => {
                if let Some(content) = map.get("content") {
                    return Self::from_wire(content);
                }
                match map.get("sections") {
                    Some(sections @ Value::Array(_)) => Ok(CustomProperties::Structured(
                        serde_json::from_value(sections.clone())?,
                    )),
                    _ => Ok(CustomProperties::Flat(map.clone())),
                }
            }
            other => Err(DsmsError::validation(
                "custom_properties",
                format!("expected an object, got `{}`", other),
            )),
        }
    }

    pub fn get(&self, label: &str) -> Option<&Value> {
        match self {
            CustomProperties::Structured(sections) => sections
                .iter()
                .flat_map(|s| s.entries.iter())
                .find(|e| e.label == label)
                .map(|e| &e.value),
            CustomProperties::Flat(map) => map.get(label),
        }
    }

    /// Set `label`, returning the previous value. New labels of structured
    /// content land in the "General" section.
    pub fn set(&mut self, label: &str, value: Value) -> Option<Value> {
        match self {
            CustomProperties::Structured(sections) => {
                if let Some(entry) = sections
                    .iter_mut()
                    .flat_map(|s| s.entries.iter_mut())
                    .find(|e| e.label == label)
                {
                    return Some(std::mem::replace(&mut entry.value, value));
                }
                let widget = Widget::infer(&value);
                let entry = Entry {
                    id: entry_id(),
                    label: label.to_string(),
                    value,
                    measurement_unit: None,
                    widget,
                    class_mapping: None,
                };
                match sections.iter_mut().find(|s| s.name == GENERAL_SECTION) {
                    Some(section) => section.entries.push(entry),
                    None => sections.push(Section {
                        id: entry_id(),
                        name: GENERAL_SECTION.to_string(),
                        entries: vec![entry],
                    }),
                }
                None
            }
            CustomProperties::Flat(map) => map.insert(label.to_string(), value),
        }
    }

    pub fn remove(&mut self, label: &str) -> Option<Value> {
        match self {
            CustomProperties::Structured(sections) => {
                for section in sections.iter_mut() {
                    if let Some(index) = section.entries.iter().position(|e| e.label == label) {
                        return Some(section.entries.remove(index).value);
                    }
                }
                None
            }
            CustomProperties::Flat(map) => map.remove(label),
        }
    }

    /// Plain label→value view
    pub fn flatten(&self) -> Map<String, Value> {
        match self {
            CustomProperties::Structured(sections) => sections
                .iter()
                .flat_map(|s| s.entries.iter())
                .map(|e| (e.label.clone(), e.value.clone()))
                .collect(),
            CustomProperties::Flat(map) => map.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CustomProperties::Structured(sections) => sections.iter().all(|s| s.entries.is_empty()),
            CustomProperties::Flat(map) => map.is_empty(),
        }
    }

    /// Wire document `{"sections": [...]}`
    ///
    /// With a webform, each value is filed under the section declaring its
    /// label and undeclared labels go to "General". Without one, structured
    /// content is sent as held and flat content becomes a single "Misc" section.
    pub fn to_content(&self, webform: Option<&Webform>) -> Result<Value> {
        let sections = match (webform, self) {
            (Some(webform), _) => sections_from_webform(&self.flatten(), webform)?,
            (None, CustomProperties::Structured(sections)) => sections.clone(),
            (None, CustomProperties::Flat(map)) => {
                if map.is_empty() {
                    Vec::new()
                } else {
                    vec![loose_section(MISC_SECTION, map)?]
                }
            }
        };
        Ok(json!({ "sections": sections }))
    }
}

fn loose_entry(label: &str, value: &Value) -> Result<Entry> {
    let widget = Widget::infer(value).ok_or_else(|| {
        DsmsError::validation(
            format!("custom_properties.{}", label),
            format!("unsupported value `{}`", value),
        )
    })?;
    Ok(Entry {
        id: entry_id(),
        label: label.to_string(),
        value: value.clone(),
        measurement_unit: None,
        widget: Some(widget),
        class_mapping: None,
    })
}

fn loose_section(name: &str, values: &Map<String, Value>) -> Result<Section> {
    Ok(Section {
        id: entry_id(),
        name: name.to_string(),
        entries: values
            .iter()
            .map(|(label, value)| loose_entry(label, value))
            .collect::<Result<_>>()?,
    })
}

fn sections_from_webform(values: &Map<String, Value>, webform: &Webform) -> Result<Vec<Section>> {
    let mut remaining = values.clone();
    let mut sections: Vec<Section> = Vec::new();

    for declared in &webform.sections {
        let name = declared.name.clone().unwrap_or_default();
        for input in &declared.inputs {
            let Some(label) = input.label.as_deref() else {
                continue;
            };
            let Some(value) = remaining.remove(label) else {
                continue;
            };
            let entry = Entry {
                id: input.id.clone(),
                label: label.to_string(),
                value,
                measurement_unit: input.measurement_unit.clone(),
                widget: input.widget,
                class_mapping: input
                    .class_mapping
                    .as_ref()
                    .map(|iri| json!({ "iri": iri })),
            };
            match sections.iter_mut().find(|s| s.name == name) {
                Some(section) => section.entries.push(entry),
                None => sections.push(Section {
                    id: declared.id.clone(),
                    name: name.clone(),
                    entries: vec![entry],
                }),
            }
        }
    }

    if !remaining.is_empty() {
        debug!(
            "Custom properties not declared by the webform: {:?}",
            remaining.keys().collect::<Vec<_>>()
        );
        sections.push(loose_section(GENERAL_SECTION, &remaining)?);
    }

    Ok(sections)
}

/// Key-level difference between two custom property views
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingDiff {
    pub added: Map<String, Value>,
    pub removed: Vec<String>,
    pub changed: Map<String, Value>,
}

impl MappingDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Change-tracked custom property slot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedProperties {
    current: CustomProperties,
    baseline: CustomProperties,
    schema: Option<Arc<Webform>>,
    ktype: Option<String>,
    strict: bool,
}

impl TrackedProperties {
    pub fn synced(content: CustomProperties) -> Self {
        Self {
            baseline: content.clone(),
            current: content,
            ..Self::default()
        }
    }

    /// Bind the webform of the item's knowledge type. With `strict`, labels the
    /// webform does not declare are rejected.
    pub fn bind_schema(&mut self, ktype: &str, schema: Option<Arc<Webform>>, strict: bool) {
        self.ktype = Some(ktype.to_string());
        self.schema = schema;
        self.strict = strict;
    }

    pub fn schema(&self) -> Option<&Webform> {
        self.schema.as_deref()
    }

    pub fn content(&self) -> &CustomProperties {
        &self.current
    }

    pub fn get(&self, label: &str) -> Option<&Value> {
        self.current.get(label)
    }

    pub fn flatten(&self) -> Map<String, Value> {
        self.current.flatten()
    }

    fn check(&self, label: &str, value: &Value) -> Result<()> {
        let declared = self.schema.as_ref().map(|webform| webform.declares(label));
        if self.strict && declared == Some(false) {
            return Err(DsmsError::SchemaViolation {
                key: label.to_string(),
                ktype: self.ktype.clone().unwrap_or_default(),
            });
        }
        if declared != Some(true) && Widget::infer(value).is_none() {
            return Err(DsmsError::validation(
                format!("custom_properties.{}", label),
                format!("unsupported value `{}`", value),
            ));
        }
        Ok(())
    }

    pub fn set(&mut self, label: &str, value: impl Into<Value>) -> Result<Option<Value>> {
        let value = value.into();
        self.check(label, &value)?;
        Ok(self.current.set(label, value))
    }

    pub fn remove(&mut self, label: &str) -> Result<Value> {
        self.current
            .remove(label)
            .ok_or_else(|| DsmsError::NotFound(format!("custom property `{}`", label)))
    }

    pub fn discard(&mut self, label: &str) -> Option<Value> {
        self.current.remove(label)
    }

    /// Replace every custom property at once
    pub fn assign(&mut self, values: Map<String, Value>) -> Result<()> {
        for (label, value) in &values {
            self.check(label, value)?;
        }
        self.current = CustomProperties::Flat(values);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.current = CustomProperties::Flat(Map::new());
    }

    pub fn diff(&self) -> MappingDiff {
        let before = self.baseline.flatten();
        let after = self.current.flatten();
        let mut diff = MappingDiff::default();

        for (label, value) in &after {
            match before.get(label) {
                None => {
                    diff.added.insert(label.clone(), value.clone());
                }
                Some(previous) if previous != value => {
                    diff.changed.insert(label.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        diff.removed = before
            .keys()
            .filter(|label| !after.contains_key(*label))
            .cloned()
            .collect();
        diff
    }

    pub fn is_dirty(&self) -> bool {
        !self.diff().is_empty()
    }

    pub fn mark_synced(&mut self) {
        self.baseline = self.current.clone();
    }

    /// Take `content` as both current and baseline, keeping the schema binding
    pub fn adopt(&mut self, content: CustomProperties) {
        self.baseline = content.clone();
        self.current = content;
    }

    pub fn reset(&mut self) {
        self.current = self.baseline.clone();
    }

    /// `{"content": {"sections": [...]}}` for the current values
    pub fn to_wire(&self) -> Result<Value> {
        Ok(json!({ "content": self.current.to_content(self.schema.as_deref())? }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::webform::{Input, WebformSection};

    fn specimen_webform() -> Arc<Webform> {
        Arc::new(Webform::new(vec![WebformSection::new(
            "Dimensions",
            vec![
                Input::new("Width", Widget::Number),
                Input::new("Length", Widget::MultiSelect),
            ],
        )]))
    }

    #[test]
    fn reads_all_wire_shapes() {
        let wrapped = json!({ "content": { "sections": [
            { "id": "s1", "name": "Dimensions", "entries": [
                { "id": "e1", "label": "Width", "value": 0.5, "type": "Number" }
            ]}
        ]}});
        let props = CustomProperties::from_wire(&wrapped).unwrap();
        assert!(matches!(props, CustomProperties::Structured(_)));
        assert_eq!(props.get("Width"), Some(&json!(0.5)));

        let flat = CustomProperties::from_wire(&json!({ "Width": 0.5 })).unwrap();
        assert!(matches!(flat, CustomProperties::Flat(_)));
        assert_eq!(flat.flatten(), props.flatten());

        assert!(CustomProperties::from_wire(&Value::Null).unwrap().is_empty());
        assert!(CustomProperties::from_wire(&json!(3)).is_err());
    }

    #[test]
    fn new_label_in_structured_content_goes_to_general() {
        let mut props = CustomProperties::Structured(vec![Section {
            id: "s1".into(),
            name: "Dimensions".into(),
            entries: vec![],
        }]);
        props.set("Operator", json!("Jane"));
        let CustomProperties::Structured(sections) = &props else {
            panic!("shape changed");
        };
        assert_eq!(sections[1].name, GENERAL_SECTION);
        assert_eq!(sections[1].entries[0].widget, Some(Widget::Text));
    }

    #[test]
    fn webform_groups_declared_labels() {
        let mut values = Map::new();
        values.insert("Width".into(), json!(0.5));
        values.insert("Length".into(), json!([0.1, 0.2]));
        values.insert("Operator".into(), json!("Jane"));
        let webform = specimen_webform();

        let content = CustomProperties::Flat(values).to_content(Some(&webform)).unwrap();
        let sections = content["sections"].as_array().unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0]["name"], "Dimensions");
        assert_eq!(sections[0]["id"], json!(webform.sections[0].id));
        assert_eq!(sections[0]["entries"][0]["label"], "Width");
        assert_eq!(sections[0]["entries"][0]["type"], "Number");
        assert_eq!(sections[1]["name"], GENERAL_SECTION);
        assert_eq!(sections[1]["entries"][0]["label"], "Operator");
    }

    #[test]
    fn flat_content_without_webform_is_misc() {
        let mut values = Map::new();
        values.insert("Width".into(), json!(0.5));
        let content = CustomProperties::Flat(values).to_content(None).unwrap();
        assert_eq!(content["sections"][0]["name"], MISC_SECTION);
        assert_eq!(content["sections"][0]["entries"][0]["type"], "Number");
    }

    #[test]
    fn strict_schema_rejects_undeclared_label() {
        let mut props = TrackedProperties::default();
        props.bind_schema("specimen", Some(specimen_webform()), true);

        assert!(props.set("Width", 0.5).is_ok());
        let err = props.set("Color", "red").unwrap_err();
        assert!(matches!(err, DsmsError::SchemaViolation { ref key, ref ktype } if key == "Color" && ktype == "specimen"));
        assert!(props.get("Color").is_none());
    }

    #[test]
    fn lenient_schema_accepts_undeclared_label() {
        let mut props = TrackedProperties::default();
        props.bind_schema("specimen", Some(specimen_webform()), false);
        assert!(props.set("Color", "red").is_ok());
    }

    #[test]
    fn no_schema_accepts_any_scalar_but_not_null() {
        let mut props = TrackedProperties::default();
        assert!(props.set("anything", true).is_ok());
        assert!(props.set("nothing", Value::Null).is_err());
    }

    #[test]
    fn diff_reports_added_changed_removed() {
        let mut base = Map::new();
        base.insert("Width".into(), json!(0.5));
        base.insert("Length".into(), json!([0.1]));
        let mut props = TrackedProperties::synced(CustomProperties::Flat(base));

        props.set("Width", 1).unwrap();
        props.remove("Length").unwrap();
        props.set("Height", 2).unwrap();

        let diff = props.diff();
        assert_eq!(diff.changed.get("Width"), Some(&json!(1)));
        assert_eq!(diff.added.get("Height"), Some(&json!(2)));
        assert_eq!(diff.removed, vec!["Length".to_string()]);

        props.mark_synced();
        assert!(!props.is_dirty());
    }

    #[test]
    fn removing_missing_label_is_not_found() {
        let mut props = TrackedProperties::default();
        assert!(matches!(props.remove("Width"), Err(DsmsError::NotFound(_))));
        assert!(props.discard("Width").is_none());
    }

    #[test]
    fn restoring_value_clears_dirty_state() {
        let mut base = Map::new();
        base.insert("Width".into(), json!(0.5));
        let mut props = TrackedProperties::synced(CustomProperties::Flat(base));
        props.set("Width", 1).unwrap();
        assert!(props.is_dirty());
        props.set("Width", 0.5).unwrap();
        assert!(!props.is_dirty());
    }
}
