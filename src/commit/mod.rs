//! Commit engine
//!
//! One pass sends everything staged in a [`Session`] in dependency order:
//!
//! 1. knowledge type creations and updates
//! 2. app configuration creations and overwrites
//! 3. item creations
//! 4. item updates carrying the structural diff
//! 5. attachment, dataframe and avatar uploads
//! 6. attachment and dataframe deletions
//! 7. item deletions
//! 8. app configuration deletions
//! 9. knowledge type deletions
//! 10. refresh of every touched item that had no failure
//!
//! Requests go out one at a time. A failed operation is recorded and the pass
//! continues with everything that does not depend on it; an item whose create
//! or update failed has its sub-object operations skipped and keeps its diff.

mod report;

pub use report::{CommitFailure, CommitOperation, CommitReport, OperationKind, SKIPPED};

use crate::apps::AppConfig;
use crate::error::{DsmsError, Result};
use crate::knowledge::patch::{create_payload, dataframe_document, update_payload};
use crate::knowledge::KItem;
use crate::session::{KItemKey, Session};
use crate::transport::{self, routes, Request, Response, Transport};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ATTACHMENT_FIELD: &str = "dataFile";
const DATAFRAME_FIELD: &str = "data";
const DATAFRAME_FILE: &str = "data.json";
const APP_DEFINITION_FIELD: &str = "def_file";

pub struct CommitEngine {
    transport: Arc<dyn Transport>,
    auto_refresh: bool,
    report: CommitReport,
    /// Items whose create or update failed
    blocked: BTreeSet<KItemKey>,
    /// Items with any failed operation
    failed: BTreeSet<KItemKey>,
    /// Items changed on the server during this pass
    touched: BTreeSet<KItemKey>,
    ktypes_changed: bool,
}

fn target(kitem: &KItem) -> String {
    kitem.name().to_string()
}

impl CommitEngine {
    pub fn new(session: &Session) -> Self {
        Self {
            transport: session.transport(),
            auto_refresh: session.config().auto_refresh,
            report: CommitReport::default(),
            blocked: BTreeSet::new(),
            failed: BTreeSet::new(),
            touched: BTreeSet::new(),
            ktypes_changed: false,
        }
    }

    async fn send(&self, request: Request) -> Result<Response> {
        debug!("{} {}", request.method, request.path);
        transport::send(self.transport.as_ref(), request).await
    }

    /// Record a failed item operation
    fn fail(&mut self, key: KItemKey, kind: OperationKind, target: String, error: &DsmsError) {
        warn!("{} `{}` failed: {}", kind, target, error);
        self.report.failure_for(key, kind, target, error.to_string());
        self.failed.insert(key);
    }

    fn skip(&mut self, key: KItemKey, kind: OperationKind, target: String) {
        debug!("Skipping {} `{}`", kind, target);
        self.report.failure_for(key, kind, target, SKIPPED);
        self.failed.insert(key);
    }

    /// Run one pass over `session`
    ///
    /// Returns the report when every operation succeeded and
    /// [`DsmsError::PartialCommit`] carrying it otherwise. A knowledge type
    /// staged for deletion while items of it still change aborts the pass
    /// before anything is sent.
    pub async fn run(mut self, session: &mut Session) -> Result<CommitReport> {
        check_type_deletions(session)?;
        info!(
            "Committing {} knowledge items, {} pending deletion",
            session.kitems.len(),
            session.pending_deletion.len()
        );

        let failed_ktypes = self.write_ktypes(session).await;
        self.write_app_configs(session).await;
        self.create_kitems(session, &failed_ktypes).await;
        self.update_kitems(session).await;
        self.upload_subobjects(session).await;
        self.delete_subobjects(session).await;
        self.delete_kitems(session).await;
        self.delete_app_configs(session).await;
        self.delete_ktypes(session).await;
        self.refresh(session).await;

        let report = self.report;
        info!(
            "Commit finished: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        if report.is_success() {
            Ok(report)
        } else {
            Err(DsmsError::PartialCommit(report))
        }
    }

    /// Create and update knowledge types; returns the ids that failed to create
    async fn write_ktypes(&mut self, session: &mut Session) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();

        let created = std::mem::take(&mut session.ktype_changes.created);
        for ktype in created {
            let result = match ktype.to_wire() {
                Ok(body) => self.send(Request::post(routes::KTYPES).json(body)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    self.report.success(OperationKind::CreateKType, ktype.id.clone());
                    self.ktypes_changed = true;
                }
                Err(e) => {
                    warn!("Creating knowledge type `{}` failed: {}", ktype.id, e);
                    self.report
                        .failure(OperationKind::CreateKType, ktype.id.clone(), e.to_string());
                    failed.insert(ktype.id.clone());
                    session.ktype_changes.created.push(ktype);
                }
            }
        }

        let updated = std::mem::take(&mut session.ktype_changes.updated);
        for ktype in updated {
            let result = match ktype.to_wire() {
                Ok(body) => self.send(Request::put(routes::ktype(&ktype.id)).json(body)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    self.report.success(OperationKind::UpdateKType, ktype.id.clone());
                    self.ktypes_changed = true;
                }
                Err(e) => {
                    warn!("Updating knowledge type `{}` failed: {}", ktype.id, e);
                    self.report
                        .failure(OperationKind::UpdateKType, ktype.id.clone(), e.to_string());
                    session.ktype_changes.updated.push(ktype);
                }
            }
        }

        failed
    }

    async fn send_app_config(&self, session: &Session, app: &AppConfig, overwrite: bool) -> Result<()> {
        let definition = app.definition(&session.config)?;
        let request = Request::post(routes::app_spec(&app.name))
            .multipart(APP_DEFINITION_FIELD, app.file_name(), definition)
            .query("overwrite", overwrite.to_string());
        self.send(request).await.map(|_| ())
    }

    /// Upload new and overwritten app configurations; failed ones stay staged
    async fn write_app_configs(&mut self, session: &mut Session) {
        let created = std::mem::take(&mut session.app_changes.created);
        for app in created {
            match self.send_app_config(session, &app, false).await {
                Ok(()) => self.report.success(OperationKind::CreateAppConfig, app.name.clone()),
                Err(e) => {
                    warn!("Creating app configuration `{}` failed: {}", app.name, e);
                    self.report
                        .failure(OperationKind::CreateAppConfig, app.name.clone(), e.to_string());
                    session.app_changes.created.push(app);
                }
            }
        }

        let updated = std::mem::take(&mut session.app_changes.updated);
        for app in updated {
            match self.send_app_config(session, &app, true).await {
                Ok(()) => self.report.success(OperationKind::UpdateAppConfig, app.name.clone()),
                Err(e) => {
                    warn!("Updating app configuration `{}` failed: {}", app.name, e);
                    self.report
                        .failure(OperationKind::UpdateAppConfig, app.name.clone(), e.to_string());
                    session.app_changes.updated.push(app);
                }
            }
        }
    }

    async fn create_kitems(&mut self, session: &mut Session, failed_ktypes: &BTreeSet<String>) {
        // Never created, so there is nothing to delete remotely
        let dropped: Vec<KItemKey> = session
            .pending_deletion
            .iter()
            .filter(|key| session.kitems.get(key).map_or(true, |k| !k.is_persisted()))
            .copied()
            .collect();
        for key in dropped {
            debug!("Dropping unsaved item {} staged for deletion", key);
            session.detach(key);
        }

        let keys: Vec<KItemKey> = session
            .kitems
            .iter()
            .filter(|(_, kitem)| !kitem.is_persisted())
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            let Some(kitem) = session.kitems.get_mut(&key) else {
                continue;
            };
            if failed_ktypes.contains(kitem.ktype_id()) {
                let name = target(kitem);
                self.skip(key, OperationKind::CreateKItem, name);
                self.blocked.insert(key);
                continue;
            }

            let result = match create_payload(kitem) {
                Ok(body) => self.send(Request::post(routes::KITEMS).json(body)).await,
                Err(e) => Err(e),
            };
            let result = result.and_then(|response| kitem.record_server_fields(&response_body(&response)?));
            match result {
                Ok(()) => {
                    kitem.confirm_structure();
                    self.report.success_for(key, OperationKind::CreateKItem, target(kitem));
                    self.touched.insert(key);
                }
                Err(e) => {
                    let name = target(kitem);
                    self.fail(key, OperationKind::CreateKItem, name, &e);
                    self.blocked.insert(key);
                }
            }
        }
    }

    async fn update_kitems(&mut self, session: &mut Session) {
        let keys: Vec<KItemKey> = session
            .kitems
            .iter()
            .filter(|(key, kitem)| {
                kitem.is_persisted()
                    && !session.pending_deletion.contains(key)
                    && !self.touched.contains(key)
                    && !self.blocked.contains(key)
                    && kitem.diff().has_structural_changes()
            })
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            let Some(kitem) = session.kitems.get_mut(&key) else {
                continue;
            };
            let Some(id) = kitem.id() else {
                continue;
            };
            let result = match update_payload(kitem, &kitem.diff()) {
                Ok(body) => self.send(Request::put(routes::kitem(id)).json(body)).await,
                Err(e) => Err(e),
            };
            let result = result.and_then(|response| kitem.record_server_fields(&response_body(&response)?));
            match result {
                Ok(()) => {
                    kitem.confirm_structure();
                    self.report.success_for(key, OperationKind::PatchKItem, target(kitem));
                    self.touched.insert(key);
                }
                Err(e) => {
                    let name = target(kitem);
                    self.fail(key, OperationKind::PatchKItem, name, &e);
                    self.blocked.insert(key);
                }
            }
        }
    }

    /// Items with a server identity that are neither deleted nor blocked;
    /// blocked items get their pending sub-object operations reported as skipped
    fn sub_object_targets(&mut self, session: &Session, uploads: bool) -> Vec<(KItemKey, Uuid)> {
        let mut targets = Vec::new();
        for (key, kitem) in &session.kitems {
            if session.pending_deletion.contains(key) {
                continue;
            }
            let patch = kitem.diff();
            if self.blocked.contains(key) {
                let name = target(kitem);
                if uploads {
                    for attachment in &patch.attachments.added {
                        self.skip(*key, OperationKind::UploadAttachment, format!("{}/{}", name, attachment.name));
                    }
                    if !patch.dataframe.is_empty() && !kitem.dataframe().is_empty() {
                        self.skip(*key, OperationKind::UploadDataFrame, name.clone());
                    }
                    if patch.avatar {
                        self.skip(*key, OperationKind::UploadAvatar, name.clone());
                    }
                } else {
                    for attachment in &patch.attachments.removed {
                        self.skip(*key, OperationKind::DeleteAttachment, format!("{}/{}", name, attachment.name));
                    }
                    if !patch.dataframe.is_empty() && kitem.dataframe().is_empty() {
                        self.skip(*key, OperationKind::DeleteDataFrame, name.clone());
                    }
                }
                continue;
            }
            if let Some(id) = kitem.id() {
                targets.push((*key, id));
            }
        }
        targets
    }

    async fn upload_subobjects(&mut self, session: &mut Session) {
        for (key, id) in self.sub_object_targets(session, true) {
            let Some(kitem) = session.kitems.get_mut(&key) else {
                continue;
            };
            let name = target(kitem);

            for attachment in kitem.attachments().pending_additions() {
                let label = format!("{}/{}", name, attachment.name);
                let result = match attachment.payload().await {
                    Ok(Some(bytes)) => {
                        let request = Request::put(routes::attachments(id)).multipart(
                            ATTACHMENT_FIELD,
                            attachment.name.clone(),
                            bytes,
                        );
                        self.send(request).await.map(|_| ())
                    }
                    Ok(None) => Err(DsmsError::validation(
                        "attachments",
                        format!("`{}` has neither content nor a source file", attachment.name),
                    )),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        kitem.attachments_mut().confirm_addition(&attachment.name);
                        self.report.success_for(key, OperationKind::UploadAttachment, label);
                        self.touched.insert(key);
                    }
                    Err(e) => self.fail(key, OperationKind::UploadAttachment, label, &e),
                }
            }

            if kitem.dataframe().is_dirty() && !kitem.dataframe().is_empty() {
                let result = match dataframe_document(kitem) {
                    Ok(document) => {
                        let request = Request::put(routes::dataframe(id)).multipart(
                            DATAFRAME_FIELD,
                            DATAFRAME_FILE,
                            document,
                        );
                        self.send(request).await.map(|_| ())
                    }
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        kitem.confirm_dataframe();
                        self.report.success_for(key, OperationKind::UploadDataFrame, name.clone());
                        self.touched.insert(key);
                    }
                    Err(e) => self.fail(key, OperationKind::UploadDataFrame, name.clone(), &e),
                }
            }

            if let Some(avatar) = kitem.pending_avatar().cloned() {
                let mut result = Ok(());
                if kitem.avatar_exists() {
                    result = match self.send(Request::delete(routes::avatar(id))).await {
                        Ok(_) | Err(DsmsError::NotFound(_)) => Ok(()),
                        Err(e) => Err(e),
                    };
                }
                if result.is_ok() {
                    result = self
                        .send(Request::put(routes::avatar(id)).json(avatar.to_wire()))
                        .await
                        .map(|_| ());
                }
                match result {
                    Ok(()) => {
                        kitem.confirm_avatar();
                        self.report.success_for(key, OperationKind::UploadAvatar, name.clone());
                        self.touched.insert(key);
                    }
                    Err(e) => self.fail(key, OperationKind::UploadAvatar, name.clone(), &e),
                }
            }
        }
    }

    async fn delete_subobjects(&mut self, session: &mut Session) {
        for (key, id) in self.sub_object_targets(session, false) {
            let Some(kitem) = session.kitems.get_mut(&key) else {
                continue;
            };
            let name = target(kitem);

            for attachment in kitem.attachments().pending_deletions() {
                let label = format!("{}/{}", name, attachment.name);
                match self
                    .send(Request::delete(routes::attachment(id, &attachment.name)))
                    .await
                {
                    Ok(_) | Err(DsmsError::NotFound(_)) => {
                        kitem.attachments_mut().confirm_deletion(&attachment.name);
                        self.report.success_for(key, OperationKind::DeleteAttachment, label);
                        self.touched.insert(key);
                    }
                    Err(e) => self.fail(key, OperationKind::DeleteAttachment, label, &e),
                }
            }

            if kitem.dataframe().is_dirty() && kitem.dataframe().is_empty() {
                match self.send(Request::delete(routes::dataframe(id))).await {
                    Ok(_) | Err(DsmsError::NotFound(_)) => {
                        kitem.confirm_dataframe();
                        self.report.success_for(key, OperationKind::DeleteDataFrame, name.clone());
                        self.touched.insert(key);
                    }
                    Err(e) => self.fail(key, OperationKind::DeleteDataFrame, name.clone(), &e),
                }
            }
        }
    }

    async fn delete_kitems(&mut self, session: &mut Session) {
        let keys: Vec<KItemKey> = session.pending_deletion.iter().copied().collect();
        for key in keys {
            let Some(kitem) = session.kitems.get(&key) else {
                session.pending_deletion.remove(&key);
                continue;
            };
            let Some(id) = kitem.id() else {
                continue;
            };
            let name = target(kitem);
            match self.send(Request::delete(routes::kitem(id))).await {
                Ok(_) | Err(DsmsError::NotFound(_)) => {
                    session.detach(key);
                    self.report.success_for(key, OperationKind::DeleteKItem, name);
                }
                Err(e) => self.fail(key, OperationKind::DeleteKItem, name, &e),
            }
        }
    }

    async fn delete_app_configs(&mut self, session: &mut Session) {
        let names = std::mem::take(&mut session.app_changes.deleted);
        for name in names {
            match self.send(Request::delete(routes::app_spec(&name))).await {
                Ok(_) | Err(DsmsError::NotFound(_)) => {
                    self.report.success(OperationKind::DeleteAppConfig, name);
                }
                Err(e) => {
                    warn!("Deleting app configuration `{}` failed: {}", name, e);
                    self.report
                        .failure(OperationKind::DeleteAppConfig, name.clone(), e.to_string());
                    session.app_changes.deleted.push(name);
                }
            }
        }
    }

    async fn delete_ktypes(&mut self, session: &mut Session) {
        let ids: Vec<String> = session.ktype_changes.deleted.iter().cloned().collect();
        for id in ids {
            match self.send(Request::delete(routes::ktype(&id))).await {
                Ok(_) | Err(DsmsError::NotFound(_)) => {
                    session.ktype_changes.deleted.remove(&id);
                    self.report.success(OperationKind::DeleteKType, id);
                    self.ktypes_changed = true;
                }
                Err(e) => {
                    warn!("Deleting knowledge type `{}` failed: {}", id, e);
                    self.report.failure(OperationKind::DeleteKType, id, e.to_string());
                }
            }
        }
    }

    async fn refresh(&mut self, session: &mut Session) {
        if !self.auto_refresh {
            return;
        }

        let keys: Vec<KItemKey> = self.touched.difference(&self.failed).copied().collect();
        for key in keys {
            let Some(kitem) = session.kitems.get_mut(&key) else {
                continue;
            };
            let Some(id) = kitem.id() else {
                continue;
            };
            let result = match self.send(Request::get(routes::kitem(id))).await {
                Ok(response) => response
                    .json::<Value>()
                    .and_then(|body| kitem.apply_server_snapshot(&body)),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                let name = target(kitem);
                self.fail(key, OperationKind::Refresh, name, &e);
            }
        }

        if self.ktypes_changed {
            if let Err(e) = session.refresh_ktypes().await {
                warn!("Refreshing knowledge types failed: {}", e);
                self.report
                    .failure(OperationKind::Refresh, "ktypes", e.to_string());
            }
        }
    }
}

/// JSON body of a write response; an empty body reads as null
fn response_body(response: &Response) -> Result<Value> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    response.json()
}

/// Reject deleting a knowledge type while items of it are created or changed
/// in the same pass
fn check_type_deletions(session: &Session) -> Result<()> {
    for ktype in &session.ktype_changes.deleted {
        let in_use: Vec<String> = session
            .kitems
            .iter()
            .filter(|(key, kitem)| {
                kitem.ktype_id() == ktype.as_str()
                    && !session.pending_deletion.contains(key)
                    && kitem.is_dirty()
            })
            .map(|(_, kitem)| target(kitem))
            .collect();
        if !in_use.is_empty() {
            return Err(DsmsError::TypeInUse {
                ktype: ktype.clone(),
                kitems: in_use,
            });
        }
    }
    Ok(())
}
