//! Webform schema attached to a knowledge type
//!
//! The webform declares which custom properties an item of the type may carry,
//! grouped into sections, together with their widget, unit and semantic class.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generate a section or entry id: prefix, epoch millis, six random chars
pub fn id_generator(prefix: &str) -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{}{}{}", prefix, chrono::Utc::now().timestamp_millis(), random)
}

fn default_id() -> String {
    id_generator("id")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Widget {
    Text,
    File,
    Textarea,
    #[serde(rename = "Vocabulary term")]
    VocabularyTerm,
    Number,
    Slider,
    Checkbox,
    Select,
    Radio,
    #[serde(rename = "Knowledge item")]
    KnowledgeItem,
    #[serde(rename = "Multi-select")]
    MultiSelect,
    #[serde(other)]
    Other,
}

impl Widget {
    /// Widget matching the shape of a value, `None` for nulls and objects
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) => Some(Widget::Text),
            Value::Number(_) => Some(Widget::Number),
            Value::Bool(_) => Some(Widget::Checkbox),
            Value::Array(_) => Some(Widget::MultiSelect),
            Value::Null | Value::Object(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementUnit {
    #[serde(default)]
    pub label: Option<Value>,
    #[serde(default)]
    pub iri: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeOptions {
    #[serde(default)]
    pub min: i64,
    #[serde(default)]
    pub max: i64,
    #[serde(default)]
    pub step: i64,
    #[serde(default)]
    pub range: bool,
}

/// One field of a webform section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub widget: Option<Widget>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub select_options: Vec<SelectOption>,
    #[serde(default)]
    pub measurement_unit: Option<MeasurementUnit>,
    #[serde(default)]
    pub class_mapping: Option<String>,
    #[serde(default)]
    pub multiple_selection: bool,
    #[serde(default)]
    pub knowledge_type: Option<String>,
    #[serde(default)]
    pub range_options: Option<RangeOptions>,
}

impl Input {
    pub fn new(label: impl Into<String>, widget: Widget) -> Self {
        Self {
            id: default_id(),
            label: Some(label.into()),
            widget: Some(widget),
            default_value: None,
            required: false,
            hint: None,
            hidden: false,
            select_options: Vec::new(),
            measurement_unit: None,
            class_mapping: None,
            multiple_selection: false,
            knowledge_type: None,
            range_options: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebformSection {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub hidden: bool,
}

impl WebformSection {
    pub fn new(name: impl Into<String>, inputs: Vec<Input>) -> Self {
        Self {
            id: default_id(),
            name: Some(name.into()),
            inputs,
            hidden: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webform {
    #[serde(default)]
    pub semantics_enabled: bool,
    #[serde(default)]
    pub sections_enabled: bool,
    #[serde(default)]
    pub class_mapping: Option<String>,
    #[serde(default)]
    pub sections: Vec<WebformSection>,
}

impl Webform {
    pub fn new(sections: Vec<WebformSection>) -> Self {
        Self {
            sections,
            ..Self::default()
        }
    }

    /// Section and input declaring `label`
    pub fn find_input(&self, label: &str) -> Option<(&WebformSection, &Input)> {
        self.sections.iter().find_map(|section| {
            section
                .inputs
                .iter()
                .find(|input| input.label.as_deref() == Some(label))
                .map(|input| (section, input))
        })
    }

    pub fn declares(&self, label: &str) -> bool {
        self.find_input(label).is_some()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .flat_map(|section| section.inputs.iter())
            .filter_map(|input| input.label.as_deref())
    }
}
