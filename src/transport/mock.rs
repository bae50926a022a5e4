//! In-memory DSMS double
//!
//! Implements the same routes as a live instance over JSON held in memory,
//! records every request, and can be told to fail specific calls. Timestamps
//! come from a logical clock that advances one second per mutation, so
//! ordering assertions are deterministic.

use super::{Body, Method, Request, Response, Transport};
use crate::error::{DsmsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// A request as observed by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Body>,
    pub query: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            Some(Body::Json(value)) => Some(value),
            _ => None,
        }
    }

    /// File name of a multipart upload
    pub fn file_name(&self) -> Option<&str> {
        match &self.body {
            Some(Body::Multipart { file_name, .. }) => Some(file_name),
            _ => None,
        }
    }

    /// Uploaded file of a multipart request as text
    pub fn file_text(&self) -> Option<String> {
        match &self.body {
            Some(Body::Multipart { bytes, .. }) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// Value of a form field
    pub fn form_value(&self, key: &str) -> Option<&str> {
        match &self.body {
            Some(Body::Form(fields)) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        query_value(&self.query, key)
    }

    pub fn is(&self, method: Method, path: &str) -> bool {
        self.method == method && self.path.trim_matches('/') == path.trim_matches('/')
    }
}

#[derive(Debug, Clone)]
struct Failure {
    method: Method,
    path: String,
    /// `None` simulates a transport error
    status: Option<u16>,
}

#[derive(Default)]
struct MockState {
    kitems: BTreeMap<String, Value>,
    ktypes: BTreeMap<String, Value>,
    attachments: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    dataframes: BTreeMap<String, Map<String, Value>>,
    app_specs: BTreeMap<String, Vec<u8>>,
    sparql_bindings: Vec<Value>,
    ticks: i64,
    log: Vec<RecordedRequest>,
    failures: Vec<Failure>,
}

impl MockState {
    fn tick(&mut self) -> String {
        self.ticks += 1;
        self.now()
    }

    fn now(&self) -> String {
        let epoch: DateTime<Utc> = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        (epoch + Duration::seconds(self.ticks)).to_rfc3339()
    }
}

#[derive(Default)]
pub struct MockServer {
    state: Mutex<MockState>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_ktype(self, ktype: Value) -> Self {
        self.insert_ktype(ktype);
        self
    }

    pub fn insert_ktype(&self, ktype: Value) {
        let mut state = self.state();
        let now = state.now();
        let mut ktype = ktype;
        if let Some(obj) = ktype.as_object_mut() {
            obj.entry("created_at").or_insert_with(|| json!(now));
            obj.entry("updated_at").or_insert_with(|| json!(now));
        }
        let id = ktype["id"].as_str().unwrap_or_default().to_string();
        state.ktypes.insert(id, ktype);
    }

    /// Store a knowledge item as if it had been created earlier; returns its id
    pub fn insert_kitem(&self, kitem: Value) -> String {
        let mut state = self.state();
        let id = kitem["id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = state.tick();
        let stored = new_kitem(&id, &kitem, &now);
        state.kitems.insert(id.clone(), stored);
        id
    }

    /// Answer `method path` with `status` until cleared
    pub fn fail(&self, method: Method, path: impl Into<String>, status: u16) {
        self.state().failures.push(Failure {
            method,
            path: path.into(),
            status: Some(status),
        });
    }

    /// Make `method path` fail without a response
    pub fn fail_transport(&self, method: Method, path: impl Into<String>) {
        self.state().failures.push(Failure {
            method,
            path: path.into(),
            status: None,
        });
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().log.clone()
    }

    pub fn clear_requests(&self) {
        self.state().log.clear();
    }

    pub fn kitem(&self, id: &str) -> Option<Value> {
        self.state().kitems.get(id).cloned()
    }

    pub fn kitem_count(&self) -> usize {
        self.state().kitems.len()
    }

    pub fn ktype(&self, id: &str) -> Option<Value> {
        self.state().ktypes.get(id).cloned()
    }

    pub fn attachment(&self, kitem_id: &str, name: &str) -> Option<Vec<u8>> {
        self.state()
            .attachments
            .get(kitem_id)
            .and_then(|files| files.get(name))
            .cloned()
    }

    pub fn dataframe(&self, kitem_id: &str) -> Option<Map<String, Value>> {
        self.state().dataframes.get(kitem_id).cloned()
    }

    /// Stored app definition parsed as JSON
    pub fn app_spec(&self, name: &str) -> Option<Value> {
        self.state()
            .app_specs
            .get(name)
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }

    /// Bindings answered to every SPARQL query
    pub fn set_sparql_bindings(&self, bindings: Vec<Value>) {
        self.state().sparql_bindings = bindings;
    }

    fn handle(state: &mut MockState, request: &Request) -> Response {
        let path = request.path.trim_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').collect();
        let body = request.json_body().cloned().unwrap_or(Value::Null);

        match (request.method, segments.as_slice()) {
            (Method::Get, ["api", "knowledge", "docs"]) => ok(json!({})),
            (Method::Get, ["api", "users", "token"]) => ok(json!({ "token": "mock-token" })),

            (Method::Get, ["api", "knowledge-type"]) => {
                ok(Value::Array(state.ktypes.values().cloned().collect()))
            }
            (Method::Post, ["api", "knowledge-type"]) => create_ktype(state, body),
            (Method::Get, ["api", "knowledge-type", id]) => match state.ktypes.get(*id) {
                Some(ktype) => ok(ktype.clone()),
                None => not_found("KType"),
            },
            (Method::Put, ["api", "knowledge-type", id]) => update_ktype(state, id, body),
            (Method::Delete, ["api", "knowledge-type", id]) => match state.ktypes.remove(*id) {
                Some(_) => ok(json!({})),
                None => not_found("KType"),
            },

            (Method::Post, ["api", "knowledge", "kitems", "search"]) => search(state, &body),
            (Method::Get, ["api", "knowledge", "kitems"]) => {
                ok(Value::Array(state.kitems.values().cloned().collect()))
            }
            (Method::Post, ["api", "knowledge", "kitems"]) => {
                if body["name"].as_str().unwrap_or_default().is_empty() {
                    return Response::new(422, "name is required");
                }
                let id = Uuid::new_v4().to_string();
                let now = state.tick();
                let stored = new_kitem(&id, &body, &now);
                state.kitems.insert(id, stored.clone());
                Response::json_value(201, &stored)
            }
            (Method::Get, ["api", "knowledge", "kitems", id]) => match state.kitems.get(*id) {
                Some(kitem) => ok(kitem.clone()),
                None => not_found("KItem"),
            },
            (Method::Put, ["api", "knowledge", "kitems", id]) => {
                if !state.kitems.contains_key(*id) {
                    return not_found("KItem");
                }
                let now = state.tick();
                match state.kitems.get_mut(*id) {
                    Some(kitem) => {
                        apply_patch(kitem, &body, &now);
                        ok(kitem.clone())
                    }
                    None => not_found("KItem"),
                }
            }
            (Method::Delete, ["api", "knowledge", "kitems", id]) => match state.kitems.remove(*id) {
                Some(_) => {
                    state.attachments.remove(*id);
                    state.dataframes.remove(*id);
                    ok(json!({}))
                }
                None => not_found("KItem"),
            },

            (Method::Put, ["api", "knowledge", "attachments", id]) => upload_attachment(state, id, request),
            (Method::Get, ["api", "knowledge", "attachments", id, name]) => {
                match state.attachments.get(*id).and_then(|files| files.get(*name)) {
                    Some(bytes) => Response::new(200, bytes.clone()),
                    None => not_found("Attachment"),
                }
            }
            (Method::Delete, ["api", "knowledge", "attachments", id, name]) => {
                delete_attachment(state, id, name)
            }

            (Method::Put, ["api", "knowledge", "data", id]) => upload_dataframe(state, id, request),
            (Method::Get, ["api", "knowledge", "data", id]) => match state.dataframes.get(*id) {
                Some(frame) => ok(Value::Array(
                    frame
                        .keys()
                        .enumerate()
                        .map(|(column_id, name)| json!({ "column_id": column_id, "name": name }))
                        .collect(),
                )),
                None => not_found("DataFrame"),
            },
            (Method::Get, ["api", "knowledge", "data", id, column]) => {
                let column_id = column
                    .strip_prefix("column-")
                    .and_then(|n| n.parse::<usize>().ok());
                match (state.dataframes.get(*id), column_id) {
                    (Some(frame), Some(column_id)) => match frame.values().nth(column_id) {
                        Some(values) => ok(json!({ "array": values })),
                        None => not_found("Column"),
                    },
                    _ => not_found("DataFrame"),
                }
            }
            (Method::Delete, ["api", "knowledge", "data", id]) => match state.dataframes.remove(*id) {
                Some(_) => ok(json!({})),
                None => not_found("DataFrame"),
            },

            (Method::Put, ["api", "knowledge", "avatar", id]) => {
                if body.get("croppedImage").and_then(Value::as_str).is_none() {
                    return Response::new(422, "croppedImage is required");
                }
                set_avatar(state, id, true)
            }
            (Method::Delete, ["api", "knowledge", "avatar", id]) => set_avatar(state, id, false),

            (Method::Post, ["api", "knowledge", "apps", "argo", "spec", name]) => {
                upload_app_spec(state, name, request)
            }
            (Method::Get, ["api", "knowledge", "apps", "argo", "spec", name]) => {
                match state.app_specs.get(*name) {
                    Some(bytes) => Response::new(200, bytes.clone()),
                    None => not_found("App specification"),
                }
            }
            (Method::Delete, ["api", "knowledge", "apps", "argo", "spec", name]) => {
                match state.app_specs.remove(*name) {
                    Some(_) => ok(json!({})),
                    None => not_found("App specification"),
                }
            }

            (Method::Post, ["api", "knowledge", "sparql"]) => sparql_query(state, request),
            (Method::Post, ["api", "knowledge", "update-query"])
            | (Method::Post, ["api", "knowledge", "add-rdf"]) => {
                if query_value(&request.query, "repository").is_none() {
                    return Response::new(422, "repository is required");
                }
                match &request.body {
                    Some(Body::Multipart { field, .. }) if field == "file" => ok(json!({})),
                    _ => Response::new(422, "field `file` expected"),
                }
            }

            _ => Response::new(404, format!("No route for {} {}", request.method, path)),
        }
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn call(&self, request: Request) -> Result<Response> {
        let mut state = self.state();
        state.log.push(RecordedRequest {
            method: request.method,
            path: request.path.clone(),
            body: request.body.clone(),
            query: request.query.clone(),
        });

        let failure = state
            .failures
            .iter()
            .find(|f| {
                f.method == request.method
                    && f.path.trim_matches('/') == request.path.trim_matches('/')
            })
            .cloned();
        if let Some(failure) = failure {
            return match failure.status {
                Some(status) => Ok(Response::new(status, "injected failure")),
                None => Err(DsmsError::Transport(format!(
                    "injected transport failure for {} {}",
                    request.method, request.path
                ))),
            };
        }

        Ok(Self::handle(&mut state, &request))
    }
}

fn query_value<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn ok(value: Value) -> Response {
    Response::json_value(200, &value)
}

fn not_found(what: &str) -> Response {
    Response::new(404, format!("{} does not exist", what))
}

fn list_or_empty(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Array(items)) => Value::Array(items.clone()),
        _ => json!([]),
    }
}

/// `{label: url}` as sent by the client into the stored list form
fn links_from_map(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Object(map)) => Value::Array(
            map.iter()
                .map(|(label, url)| json!({ "label": label, "url": url }))
                .collect(),
        ),
        Some(Value::Array(items)) => Value::Array(items.clone()),
        _ => json!([]),
    }
}

fn new_kitem(id: &str, body: &Value, now: &str) -> Value {
    let linked: Vec<Value> = list_or_empty(body.get("linked_kitems"))
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|link| json!({ "id": link["id"], "source_id": id }))
        .collect();

    json!({
        "id": id,
        "name": body["name"],
        "slug": body.get("slug").cloned().unwrap_or(Value::Null),
        "ktype_id": body.get("ktype_id").cloned().unwrap_or(Value::Null),
        "summary": body.get("summary").cloned().unwrap_or(Value::Null),
        "annotations": list_or_empty(body.get("annotations")),
        "attachments": [],
        "linked_kitems": linked,
        "affiliations": list_or_empty(body.get("affiliations")),
        "contacts": list_or_empty(body.get("contacts")),
        "external_links": links_from_map(body.get("external_links")),
        "user_groups": list_or_empty(body.get("user_groups")),
        "kitem_apps": list_or_empty(body.get("kitem_apps")),
        "custom_properties": body.get("custom_properties").cloned().unwrap_or(Value::Null),
        "avatar_exists": false,
        "created_at": now,
        "updated_at": now,
    })
}

/// Remove entries matching `remove` and upsert `add`, both compared on `key`
fn merge_by_key(list: &mut Value, add: Option<&Value>, remove: Option<&Value>, key: &str) {
    if !list.is_array() {
        *list = json!([]);
    }
    let Some(items) = list.as_array_mut() else {
        return;
    };
    if let Some(Value::Array(remove)) = remove {
        items.retain(|item| !remove.iter().any(|r| r[key] == item[key]));
    }
    if let Some(Value::Array(add)) = add {
        for entry in add {
            match items.iter_mut().find(|item| item[key] == entry[key]) {
                Some(existing) => *existing = entry.clone(),
                None => items.push(entry.clone()),
            }
        }
    }
}

fn apply_patch(kitem: &mut Value, patch: &Value, now: &str) {
    for scalar in ["name", "slug", "summary"] {
        if let Some(value) = patch.get(scalar) {
            kitem[scalar] = value.clone();
        }
    }

    merge_by_key(
        &mut kitem["annotations"],
        patch.get("annotations_to_link"),
        patch.get("annotations_to_unlink"),
        "iri",
    );
    merge_by_key(
        &mut kitem["user_groups"],
        patch.get("user_groups_to_add"),
        patch.get("user_groups_to_remove"),
        "group_id",
    );
    merge_by_key(
        &mut kitem["kitem_apps"],
        patch.get("kitem_apps_to_update"),
        patch.get("kitem_apps_to_remove"),
        "executable",
    );

    let source_id = kitem["id"].clone();
    let to_link = patch.get("kitems_to_link").map(|links| {
        Value::Array(
            links
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|link| json!({ "id": link["id"], "source_id": source_id }))
                .collect(),
        )
    });
    merge_by_key(
        &mut kitem["linked_kitems"],
        to_link.as_ref(),
        patch.get("kitems_to_unlink"),
        "id",
    );

    for full in ["affiliations", "contacts", "custom_properties"] {
        if let Some(value) = patch.get(full) {
            kitem[full] = value.clone();
        }
    }
    if patch.get("external_links").is_some() {
        kitem["external_links"] = links_from_map(patch.get("external_links"));
    }

    kitem["updated_at"] = json!(now);
}

fn search(state: &MockState, body: &Value) -> Response {
    let term = body["search_term"].as_str().unwrap_or_default().to_lowercase();
    let ktypes: Vec<&str> = body["ktypes"]
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let annotations: Vec<&str> = body["annotations"]
        .as_array()
        .map(|list| list.iter().filter_map(|a| a["iri"].as_str()).collect())
        .unwrap_or_default();
    let limit = body["limit"].as_u64().unwrap_or(10) as usize;

    let hits: Vec<Value> = state
        .kitems
        .values()
        .filter(|kitem| {
            kitem["name"]
                .as_str()
                .map(|name| name.to_lowercase().contains(&term))
                .unwrap_or(false)
        })
        .filter(|kitem| {
            ktypes.is_empty()
                || kitem["ktype_id"]
                    .as_str()
                    .map(|id| ktypes.contains(&id))
                    .unwrap_or(false)
        })
        .filter(|kitem| {
            annotations.is_empty()
                || kitem["annotations"]
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .any(|a| a["iri"].as_str().map(|iri| annotations.contains(&iri)).unwrap_or(false))
                    })
                    .unwrap_or(false)
        })
        .take(limit)
        .map(|kitem| json!({ "hit": kitem, "fuzzy": false }))
        .collect();

    ok(Value::Array(hits))
}

fn create_ktype(state: &mut MockState, body: Value) -> Response {
    let Some(id) = body["id"].as_str().map(str::to_string) else {
        return Response::new(422, "id is required");
    };
    if state.ktypes.contains_key(&id) {
        return Response::new(409, format!("KType `{}` already exists", id));
    }
    let now = state.tick();
    let mut stored = body;
    stored["created_at"] = json!(now);
    stored["updated_at"] = json!(now);
    state.ktypes.insert(id, stored.clone());
    Response::json_value(201, &stored)
}

fn update_ktype(state: &mut MockState, id: &str, body: Value) -> Response {
    if !state.ktypes.contains_key(id) {
        return not_found("KType");
    }
    let now = state.tick();
    let Some(stored) = state.ktypes.get_mut(id) else {
        return not_found("KType");
    };
    for field in ["name", "webform", "json_schema"] {
        if let Some(value) = body.get(field) {
            stored[field] = value.clone();
        }
    }
    stored["updated_at"] = json!(now);
    ok(stored.clone())
}

fn refresh_attachment_list(state: &mut MockState, id: &str) {
    let names: Vec<Value> = state
        .attachments
        .get(id)
        .map(|files| files.keys().map(|name| json!({ "name": name })).collect())
        .unwrap_or_default();
    if let Some(kitem) = state.kitems.get_mut(id) {
        kitem["attachments"] = Value::Array(names);
    }
}

fn upload_attachment(state: &mut MockState, id: &str, request: &Request) -> Response {
    if !state.kitems.contains_key(id) {
        return not_found("KItem");
    }
    let Some(Body::Multipart {
        field,
        file_name,
        bytes,
    }) = &request.body
    else {
        return Response::new(422, "multipart upload expected");
    };
    if field != "dataFile" {
        return Response::new(422, "field `dataFile` expected");
    }
    state
        .attachments
        .entry(id.to_string())
        .or_default()
        .insert(file_name.clone(), bytes.clone());
    refresh_attachment_list(state, id);
    ok(json!({}))
}

fn delete_attachment(state: &mut MockState, id: &str, name: &str) -> Response {
    let removed = state
        .attachments
        .get_mut(id)
        .and_then(|files| files.remove(name));
    match removed {
        Some(_) => {
            refresh_attachment_list(state, id);
            ok(json!({}))
        }
        None => not_found("Attachment"),
    }
}

fn upload_dataframe(state: &mut MockState, id: &str, request: &Request) -> Response {
    if !state.kitems.contains_key(id) {
        return not_found("KItem");
    }
    let Some(Body::Multipart { bytes, .. }) = &request.body else {
        return Response::new(422, "multipart upload expected");
    };
    match serde_json::from_slice::<Map<String, Value>>(bytes) {
        Ok(frame) => {
            state.dataframes.insert(id.to_string(), frame);
            ok(json!({}))
        }
        Err(e) => Response::new(422, format!("invalid dataframe: {}", e)),
    }
}

fn set_avatar(state: &mut MockState, id: &str, exists: bool) -> Response {
    match state.kitems.get_mut(id) {
        Some(kitem) => {
            kitem["avatar_exists"] = json!(exists);
            ok(json!({}))
        }
        None => not_found("KItem"),
    }
}

fn upload_app_spec(state: &mut MockState, name: &str, request: &Request) -> Response {
    let Some(Body::Multipart { field, bytes, .. }) = &request.body else {
        return Response::new(422, "multipart upload expected");
    };
    if field != "def_file" {
        return Response::new(422, "field `def_file` expected");
    }
    let overwrite = query_value(&request.query, "overwrite") == Some("true");
    if state.app_specs.contains_key(name) && !overwrite {
        return Response::new(409, format!("App specification `{}` already exists", name));
    }
    state.app_specs.insert(name.to_string(), bytes.clone());
    Response::new(200, name.to_string())
}

fn sparql_query(state: &MockState, request: &Request) -> Response {
    let query = match &request.body {
        Some(Body::Form(fields)) => fields.iter().find(|(k, _)| k == "query").map(|(_, v)| v),
        _ => None,
    };
    if query.map_or(true, |q| q.trim().is_empty()) {
        return Response::new(422, "query is required");
    }
    if query_value(&request.query, "repository").is_none() {
        return Response::new(422, "repository is required");
    }
    ok(json!({
        "head": { "vars": [] },
        "results": { "bindings": state.sparql_bindings },
    }))
}
