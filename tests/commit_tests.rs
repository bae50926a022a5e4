mod common;

use common::{connect, connect_with, mock_server, seed_kitem, test_config, uuid, HOST};
use dsms_sdk::knowledge::EntityState;
use dsms_sdk::transport::{routes, Method};
use dsms_sdk::{
    Annotation, App, AppConfig, Attachment, Column, DsmsError, KType, OperationKind, UserGroup,
    Webform,
};
use serde_json::{json, Value};

fn workflow() -> Value {
    json!({
        "metadata": { "generateName": "tensile-analysis-" },
        "spec": {
            "entrypoint": "main",
            "arguments": { "parameters": [{ "name": "kitem_id", "value": "" }] }
        }
    })
}

fn position(requests: &[dsms_sdk::transport::RecordedRequest], method: Method, path: &str) -> usize {
    requests
        .iter()
        .position(|r| r.is(method, path))
        .unwrap_or_else(|| panic!("no {} {} in {:?}", method, path, requests))
}

#[tokio::test]
async fn test_create_then_patch_with_attachment() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    let key = session.new_kitem("Specimen123", "specimen").unwrap();
    let kitem = session.kitem_mut(key).unwrap();
    kitem.custom_properties_mut().set("Width", 0.5).unwrap();
    kitem.custom_properties_mut().set("Length", json!([0.1, 0.2])).unwrap();

    let report = session.commit().await.unwrap();
    assert_eq!(report.succeeded_with(OperationKind::CreateKItem).count(), 1);
    let kitem = session.kitem(key).unwrap();
    let id = kitem.id().unwrap().to_string();
    assert!(kitem.created_at().is_some());
    assert_eq!(kitem.created_at(), kitem.updated_at());
    assert!(!kitem.is_dirty());

    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].is(Method::Post, routes::KITEMS));
    assert!(requests[0].json().unwrap().get("id").is_none());
    assert!(requests[1].is(Method::Get, &routes::kitem(&id)));
    assert_eq!(mock.kitem(&id).unwrap()["slug"], "specimen123");
    assert_eq!(session.state(key), Some(EntityState::Clean));

    mock.clear_requests();
    let kitem = session.kitem_mut(key).unwrap();
    kitem.custom_properties_mut().set("Width", 1).unwrap();
    kitem
        .attachments_mut()
        .push(Attachment::from_bytes("t.txt", b"hello".to_vec()))
        .unwrap();
    assert_eq!(session.state(key), Some(EntityState::Dirty));

    session.commit().await.unwrap();
    let requests = mock.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].is(Method::Put, &routes::kitem(&id)));
    let body = requests[0].json().unwrap();
    assert!(body.get("name").is_none());
    let entries = &body["custom_properties"]["content"]["sections"][0]["entries"];
    assert_eq!(entries[0]["label"], "Width");
    assert_eq!(entries[0]["value"], 1);
    assert!(requests[1].is(Method::Put, &routes::attachments(&id)));
    assert_eq!(requests[1].file_name(), Some("t.txt"));
    assert!(requests[2].is(Method::Get, &routes::kitem(&id)));

    assert_eq!(mock.attachment(&id, "t.txt").unwrap(), b"hello".to_vec());
    let kitem = session.kitem(key).unwrap();
    assert!(!kitem.is_dirty());
    assert!(kitem.updated_at() > kitem.created_at());
    assert_eq!(kitem.custom_properties().get("Width"), Some(&json!(1)));
    assert!(kitem.attachments().contains_key(&"t.txt".to_string()));
}

#[tokio::test]
async fn test_creates_precede_patches() {
    let mock = mock_server();
    let id = seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    let existing = session.fetch_kitem(uuid(&id)).await.unwrap();
    session.kitem_mut(existing).unwrap().set_name("Specimen 123").unwrap();
    session
        .kitem_mut(existing)
        .unwrap()
        .attachments_mut()
        .push(Attachment::from_bytes("t.txt", b"x".to_vec()))
        .unwrap();
    let created = session.new_kitem("Specimen124", "specimen").unwrap();
    mock.clear_requests();

    session.commit().await.unwrap();
    let requests = mock.requests();
    let create = position(&requests, Method::Post, routes::KITEMS);
    assert_eq!(create, 0);
    assert!(create < position(&requests, Method::Put, &routes::kitem(&id)));
    assert!(create < position(&requests, Method::Put, &routes::attachments(&id)));
    assert_eq!(session.state(created), Some(EntityState::Clean));
    assert_eq!(session.state(existing), Some(EntityState::Clean));
}

#[tokio::test]
async fn test_removing_absent_attachment() {
    let mock = mock_server();
    let id = seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    let key = session.fetch_kitem(uuid(&id)).await.unwrap();

    let kitem = session.kitem_mut(key).unwrap();
    let err = kitem.attachments_mut().remove_key(&"x".to_string()).unwrap_err();
    assert!(matches!(err, DsmsError::NotFound(_)));
    assert!(kitem.attachments_mut().discard(&"x".to_string()).is_none());
    assert!(!kitem.is_dirty());

    mock.clear_requests();
    let report = session.commit().await.unwrap();
    assert!(report.is_empty());
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_commit_without_changes_sends_nothing() {
    let mock = mock_server();
    seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    session.fetch_all_kitems().await.unwrap();
    mock.clear_requests();

    assert!(session.commit().await.unwrap().is_empty());
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_failed_patch_is_isolated() {
    let mock = mock_server();
    let alpha_id = seed_kitem(&mock, "Alpha", "specimen");
    let beta_id = seed_kitem(&mock, "Beta", "specimen");
    let mut session = connect(&mock).await;
    let alpha = session.fetch_kitem(uuid(&alpha_id)).await.unwrap();
    let beta = session.fetch_kitem(uuid(&beta_id)).await.unwrap();

    let kitem = session.kitem_mut(alpha).unwrap();
    kitem.set_name("Alpha 2").unwrap();
    kitem
        .attachments_mut()
        .push(Attachment::from_bytes("t.txt", b"a".to_vec()))
        .unwrap();
    session.kitem_mut(beta).unwrap().set_name("Beta 2").unwrap();

    mock.fail(Method::Put, routes::kitem(&alpha_id), 500);
    mock.clear_requests();

    let report = match session.commit().await {
        Err(DsmsError::PartialCommit(report)) => report,
        other => panic!("expected a partial commit, got {:?}", other),
    };

    let patch_failure = report.failed_with(OperationKind::PatchKItem).next().unwrap();
    assert_eq!(patch_failure.operation.target, "Alpha 2");
    assert!(patch_failure.reason.contains("500"));
    let upload = report.failed_with(OperationKind::UploadAttachment).next().unwrap();
    assert_eq!(upload.operation.target, "Alpha 2/t.txt");
    assert!(upload.is_skipped());
    assert_eq!(
        report
            .succeeded_with(OperationKind::PatchKItem)
            .map(|op| op.target.as_str())
            .collect::<Vec<_>>(),
        vec!["Beta 2"]
    );

    assert!(mock
        .requests()
        .iter()
        .all(|r| !r.is(Method::Put, &routes::attachments(&alpha_id))));
    assert_eq!(mock.kitem(&alpha_id).unwrap()["name"], "Alpha");
    assert_eq!(mock.kitem(&beta_id).unwrap()["name"], "Beta 2");
    assert_eq!(session.state(alpha), Some(EntityState::Dirty));
    assert_eq!(session.state(beta), Some(EntityState::Clean));

    mock.clear_failures();
    let report = session.commit().await.unwrap();
    assert!(report.is_success());
    assert_eq!(mock.kitem(&alpha_id).unwrap()["name"], "Alpha 2");
    assert!(mock.attachment(&alpha_id, "t.txt").is_some());
    assert_eq!(session.state(alpha), Some(EntityState::Clean));
}

#[tokio::test]
async fn test_transport_failure_leaves_item_unsaved() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    let key = session.new_kitem("Specimen123", "specimen").unwrap();

    mock.fail_transport(Method::Post, routes::KITEMS);
    let err = session.commit().await.unwrap_err();
    let DsmsError::PartialCommit(report) = err else {
        panic!("expected a partial commit");
    };
    assert!(report.failed[0].reason.contains("injected transport failure"));
    assert_eq!(session.state(key), Some(EntityState::Unsaved));
    assert_eq!(mock.kitem_count(), 0);

    mock.clear_failures();
    session.commit().await.unwrap();
    assert_eq!(session.state(key), Some(EntityState::Clean));
    assert_eq!(mock.kitem_count(), 1);
}

#[tokio::test]
async fn test_link_sets_and_replaced_slots() {
    let mock = mock_server();
    let id = mock.insert_kitem(json!({
        "name": "Specimen123",
        "ktype_id": "specimen",
        "annotations": [{ "iri": "http://example.org/Steel", "label": "Steel", "namespace": "http://example.org" }],
        "affiliations": [{ "name": "IWM" }]
    }));
    let target_id = seed_kitem(&mock, "Machine 1", "machine");
    let mut session = connect(&mock).await;
    let key = session.fetch_kitem(uuid(&id)).await.unwrap();

    let kitem = session.kitem_mut(key).unwrap();
    kitem
        .annotations_mut()
        .remove_key(&"http://example.org/Steel".to_string())
        .unwrap();
    kitem
        .annotations_mut()
        .push(Annotation::from_iri("http://example.org/Aluminium"))
        .unwrap();
    kitem
        .linked_kitems_mut()
        .push(dsms_sdk::LinkedKItem::new(uuid(&target_id)))
        .unwrap();
    kitem.user_groups_mut().push(UserGroup::new("Lab", "lab-1")).unwrap();
    kitem
        .affiliations_mut()
        .push(dsms_sdk::Affiliation::new("KIT"))
        .unwrap();
    mock.clear_requests();

    session.commit().await.unwrap();
    let body = mock.requests()[0].json().cloned().unwrap();
    assert_eq!(body["annotations_to_unlink"][0]["iri"], "http://example.org/Steel");
    assert_eq!(body["annotations_to_link"][0]["iri"], "http://example.org/Aluminium");
    assert_eq!(body["kitems_to_link"], json!([{ "id": target_id }]));
    assert_eq!(body["user_groups_to_add"][0]["group_id"], "lab-1");
    assert_eq!(body["affiliations"], json!([{ "name": "IWM" }, { "name": "KIT" }]));
    assert!(body.get("contacts").is_none());
    assert!(body.get("custom_properties").is_none());

    let stored = mock.kitem(&id).unwrap();
    assert_eq!(stored["annotations"].as_array().unwrap().len(), 1);
    assert_eq!(stored["linked_kitems"][0]["source_id"], json!(id));

    let kitem = session.kitem(key).unwrap();
    assert!(!kitem.is_dirty());
    assert_eq!(kitem.linked_kitems().items()[0].source_id, Some(uuid(&id)));
}

#[tokio::test]
async fn test_custom_properties_follow_webform() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    let key = session.new_kitem("Specimen123", "specimen").unwrap();
    let kitem = session.kitem_mut(key).unwrap();
    kitem.custom_properties_mut().set("Width", 0.5).unwrap();
    kitem.custom_properties_mut().set("Material", "Steel").unwrap();

    session.commit().await.unwrap();
    let id = session.kitem(key).unwrap().id().unwrap().to_string();
    let stored = mock.kitem(&id).unwrap();
    let sections = stored["custom_properties"]["content"]["sections"]
        .as_array()
        .cloned()
        .unwrap();
    assert_eq!(sections.len(), 1);
    assert_eq!(sections[0]["name"], "Dimensions");
    assert_eq!(sections[0]["entries"][0]["id"], "input1");

    let kitem = session.kitem(key).unwrap();
    assert!(!kitem.is_dirty());
    assert_eq!(kitem.custom_properties().get("Width"), Some(&json!(0.5)));

    mock.clear_requests();
    session
        .kitem_mut(key)
        .unwrap()
        .custom_properties_mut()
        .set("Width", 0.75)
        .unwrap();
    session.commit().await.unwrap();
    let body = mock.requests()[0].json().cloned().unwrap();
    assert_eq!(body.as_object().unwrap().len(), 1);
    assert!(body.get("custom_properties").is_some());
}

#[tokio::test]
async fn test_dataframe_upload_and_removal() {
    let mock = mock_server();
    let id = seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    let key = session.fetch_kitem(uuid(&id)).await.unwrap();
    session.fetch_dataframe(key).await.unwrap();

    session
        .kitem_mut(key)
        .unwrap()
        .dataframe_mut()
        .unwrap()
        .push(Column::new("force", vec![json!(1.0), json!(2.0)]))
        .unwrap();
    mock.clear_requests();
    session.commit().await.unwrap();

    let requests = mock.requests();
    assert!(requests[0].is(Method::Put, &routes::dataframe(&id)));
    assert_eq!(requests[0].file_name(), Some("data.json"));
    assert_eq!(mock.dataframe(&id).unwrap()["force"], json!([1.0, 2.0]));
    assert!(!session.kitem(key).unwrap().is_dirty());

    session.kitem_mut(key).unwrap().dataframe_mut().unwrap().clear();
    mock.clear_requests();
    session.commit().await.unwrap();
    assert!(mock.requests()[0].is(Method::Delete, &routes::dataframe(&id)));
    assert!(mock.dataframe(&id).is_none());
}

#[tokio::test]
async fn test_fetched_item_keeps_server_columns() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    let key = session.new_kitem("Specimen123", "specimen").unwrap();
    session
        .kitem_mut(key)
        .unwrap()
        .dataframe_mut()
        .unwrap()
        .assign(vec![
            Column::new("force", vec![json!(1.0)]),
            Column::new("strain", vec![json!(0.1)]),
        ])
        .unwrap();
    session.commit().await.unwrap();
    let id = session.kitem(key).unwrap().id().unwrap();

    let mut other = connect(&mock).await;
    let key = other.fetch_kitem(id).await.unwrap();
    let kitem = other.kitem_mut(key).unwrap();
    assert!(matches!(kitem.dataframe_mut(), Err(DsmsError::Validation { .. })));
    assert!(!kitem.is_dirty());

    other.fetch_dataframe(key).await.unwrap();
    other
        .kitem_mut(key)
        .unwrap()
        .dataframe_mut()
        .unwrap()
        .push(Column::new("time", vec![json!(0.0)]))
        .unwrap();
    other.commit().await.unwrap();

    let frame = mock.dataframe(&id.to_string()).unwrap();
    let mut columns: Vec<&str> = frame.keys().map(String::as_str).collect();
    columns.sort();
    assert_eq!(columns, vec!["force", "strain", "time"]);
    assert_eq!(frame["force"], json!([1.0]));
}

#[tokio::test]
async fn test_avatar_replaces_existing_image() {
    let mock = mock_server();
    let id = seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    let key = session.fetch_kitem(uuid(&id)).await.unwrap();

    session
        .kitem_mut(key)
        .unwrap()
        .set_avatar(b"\x89PNG".to_vec(), "avatar.png")
        .unwrap();
    mock.clear_requests();
    session.commit().await.unwrap();

    let requests = mock.requests();
    assert!(requests[0].is(Method::Put, &routes::avatar(&id)));
    let body = requests[0].json().unwrap();
    assert!(body["croppedImage"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));
    assert_eq!(body["filename"], "avatar.png");
    assert!(session.kitem(key).unwrap().avatar_exists());
    assert!(session.kitem(key).unwrap().pending_avatar().is_none());

    session
        .kitem_mut(key)
        .unwrap()
        .set_avatar(b"GIF89a".to_vec(), "avatar.gif")
        .unwrap();
    mock.clear_requests();
    session.commit().await.unwrap();
    let requests = mock.requests();
    assert!(requests[0].is(Method::Delete, &routes::avatar(&id)));
    assert!(requests[1].is(Method::Put, &routes::avatar(&id)));
}

#[tokio::test]
async fn test_attachment_deletion() {
    let mock = mock_server();
    let id = seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    let key = session.fetch_kitem(uuid(&id)).await.unwrap();
    session
        .kitem_mut(key)
        .unwrap()
        .attachments_mut()
        .push(Attachment::from_bytes("t.txt", b"hello".to_vec()))
        .unwrap();
    session.commit().await.unwrap();

    let bytes = session.download_attachment(key, "t.txt").await.unwrap();
    assert_eq!(bytes, b"hello".to_vec());

    session
        .kitem_mut(key)
        .unwrap()
        .attachments_mut()
        .remove_key(&"t.txt".to_string())
        .unwrap();
    mock.clear_requests();
    let report = session.commit().await.unwrap();

    assert!(mock.requests()[0].is(Method::Delete, &routes::attachment(&id, "t.txt")));
    assert_eq!(
        report.succeeded_with(OperationKind::DeleteAttachment).next().unwrap().target,
        "Specimen123/t.txt"
    );
    assert!(mock.attachment(&id, "t.txt").is_none());
    assert!(session.kitem(key).unwrap().attachments().is_empty());
}

#[tokio::test]
async fn test_attachment_without_content_is_rejected_locally() {
    let mock = mock_server();
    let id = seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    let key = session.fetch_kitem(uuid(&id)).await.unwrap();
    let kitem = session.kitem_mut(key).unwrap();

    let err = kitem.attachments_mut().push(Attachment::named("missing.txt")).unwrap_err();
    assert!(matches!(err, DsmsError::Validation { .. }));
    assert!(kitem.attachments().is_empty());
    assert!(!kitem.is_dirty());

    kitem.set_name("Specimen124").unwrap();
    let report = session.commit().await.unwrap();
    assert_eq!(report.succeeded_with(OperationKind::PatchKItem).count(), 1);
    assert_eq!(report.succeeded_with(OperationKind::UploadAttachment).count(), 0);
    assert!(mock
        .requests()
        .iter()
        .all(|r| !r.is(Method::Put, &routes::attachments(&id))));
}

#[tokio::test]
async fn test_kitem_deletion() {
    let mock = mock_server();
    let id = seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    let key = session.fetch_kitem(uuid(&id)).await.unwrap();

    session.delete_kitem(key).unwrap();
    mock.clear_requests();
    let report = session.commit().await.unwrap();

    assert!(mock.requests()[0].is(Method::Delete, &routes::kitem(&id)));
    assert_eq!(report.succeeded_with(OperationKind::DeleteKItem).count(), 1);
    assert_eq!(mock.kitem_count(), 0);
    assert!(session.kitem(key).is_none());
    assert!(session.is_empty());
}

#[tokio::test]
async fn test_deleting_already_deleted_kitem_succeeds() {
    let mock = mock_server();
    let id = seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    let key = session.fetch_kitem(uuid(&id)).await.unwrap();

    mock.fail(Method::Delete, routes::kitem(&id), 404);
    session.delete_kitem(key).unwrap();
    session.commit().await.unwrap();
    assert!(session.is_empty());
}

#[tokio::test]
async fn test_deleting_unsaved_kitem_sends_nothing() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    let key = session.new_kitem("Specimen123", "specimen").unwrap();

    session.delete_kitem(key).unwrap();
    let report = session.commit().await.unwrap();
    assert!(report.is_empty());
    assert!(mock.requests().is_empty());
    assert!(session.is_empty());
}

#[tokio::test]
async fn test_ktype_created_before_its_items() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    session
        .create_ktype(KType::new("batch").with_name("Batch"))
        .unwrap();
    let key = session.new_kitem("Lot 7", "batch").unwrap();

    session.commit().await.unwrap();
    let requests = mock.requests();
    assert!(
        position(&requests, Method::Post, routes::KTYPES)
            < position(&requests, Method::Post, routes::KITEMS)
    );
    assert_eq!(mock.ktype("batch").unwrap()["name"], "Batch");
    assert!(session.ktype("batch").is_some());
    assert_eq!(session.state(key), Some(EntityState::Clean));
}

#[tokio::test]
async fn test_failed_ktype_creation_skips_its_items() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    session.create_ktype(KType::new("batch")).unwrap();
    let lot = session.new_kitem("Lot 7", "batch").unwrap();
    let specimen = session.new_kitem("Specimen123", "specimen").unwrap();

    mock.fail(Method::Post, routes::KTYPES, 500);
    let Err(DsmsError::PartialCommit(report)) = session.commit().await else {
        panic!("expected a partial commit");
    };
    assert_eq!(report.failed_with(OperationKind::CreateKType).count(), 1);
    let skipped = report.failed_with(OperationKind::CreateKItem).next().unwrap();
    assert_eq!(skipped.operation.target, "Lot 7");
    assert!(skipped.is_skipped());
    assert_eq!(session.state(lot), Some(EntityState::Unsaved));
    assert_eq!(session.state(specimen), Some(EntityState::Clean));

    mock.clear_failures();
    session.commit().await.unwrap();
    assert_eq!(session.state(lot), Some(EntityState::Clean));
    assert!(mock.ktype("batch").is_some());
}

#[tokio::test]
async fn test_ktype_update_rebinds_webform() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    let mut machine = (*session.ktype("machine").unwrap()).clone();
    machine.webform = Some(Webform::new(vec![dsms_sdk::knowledge::WebformSection::new(
        "Settings",
        vec![dsms_sdk::knowledge::Input::new(
            "Speed",
            dsms_sdk::knowledge::Widget::Number,
        )],
    )]));
    session.update_ktype(machine).unwrap();

    session.commit().await.unwrap();
    assert!(mock.requests()[0].is(Method::Put, &routes::ktype("machine")));
    assert_eq!(
        mock.ktype("machine").unwrap()["webform"]["sections"][0]["name"],
        "Settings"
    );
    assert!(session
        .ktype("machine")
        .unwrap()
        .webform
        .as_ref()
        .unwrap()
        .declares("Speed"));
}

#[tokio::test]
async fn test_ktype_in_use_aborts_before_sending() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    session.new_kitem("Specimen124", "specimen").unwrap();
    session.delete_ktype("specimen").unwrap();

    match session.commit().await {
        Err(DsmsError::TypeInUse { ktype, kitems }) => {
            assert_eq!(ktype, "specimen");
            assert_eq!(kitems, vec!["Specimen124".to_string()]);
        }
        other => panic!("expected TypeInUse, got {:?}", other),
    }
    assert!(mock.requests().is_empty());
    assert!(mock.ktype("specimen").is_some());
}

#[tokio::test]
async fn test_ktype_deleted_after_its_items() {
    let mock = mock_server();
    let id = seed_kitem(&mock, "Specimen123", "specimen");
    let mut session = connect(&mock).await;
    let key = session.fetch_kitem(uuid(&id)).await.unwrap();
    session.delete_kitem(key).unwrap();
    session.delete_ktype("specimen").unwrap();
    mock.clear_requests();

    session.commit().await.unwrap();
    let requests = mock.requests();
    assert!(
        position(&requests, Method::Delete, &routes::kitem(&id))
            < position(&requests, Method::Delete, &routes::ktype("specimen"))
    );
    assert!(mock.ktype("specimen").is_none());
    assert!(session.ktype("specimen").is_none());
}

#[tokio::test]
async fn test_refresh_can_be_switched_off() {
    let mock = mock_server();
    let mut config = test_config();
    config.auto_refresh = false;
    let mut session = connect_with(&mock, config).await;
    session.new_kitem("Specimen123", "specimen").unwrap();

    session.commit().await.unwrap();
    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].is(Method::Post, routes::KITEMS));
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    let key = session.new_kitem("Specimen123", "specimen").unwrap();
    session
        .kitem_mut(key)
        .unwrap()
        .user_groups_mut()
        .push(UserGroup::new("Lab", "lab-1"))
        .unwrap();
    session.commit().await.unwrap();

    let before = session.kitem(key).unwrap().clone();
    let id = before.id().unwrap();
    session.fetch_kitem(id).await.unwrap();
    assert_eq!(session.kitem(key).unwrap(), &before);
    assert_eq!(
        session.kitem(key).unwrap().updated_at(),
        mock.kitem(&id.to_string())
            .and_then(|v| v["updated_at"].as_str().map(str::to_string))
            .and_then(|s| s.parse().ok())
    );
}

#[tokio::test]
async fn test_report_tells_items_with_same_name_apart() {
    let mock = mock_server();
    let first_id = seed_kitem(&mock, "Specimen", "specimen");
    let second_id = seed_kitem(&mock, "Specimen", "specimen");
    let mut session = connect(&mock).await;
    let first = session.fetch_kitem(uuid(&first_id)).await.unwrap();
    let second = session.fetch_kitem(uuid(&second_id)).await.unwrap();
    for key in [first, second] {
        session
            .kitem_mut(key)
            .unwrap()
            .set_summary(Some("Tensile specimen".to_string()));
    }
    mock.fail(Method::Put, routes::kitem(&second_id), 500);

    let Err(DsmsError::PartialCommit(report)) = session.commit().await else {
        panic!("expected a partial commit");
    };
    assert_eq!(report.failures_of(second).count(), 1);
    assert_eq!(report.failures_of(first).count(), 0);
    let patched = report.succeeded_with(OperationKind::PatchKItem).next().unwrap();
    assert_eq!(patched.kitem, Some(first));
    assert!(report
        .to_string()
        .contains(&format!("patch kitem `Specimen` ({})", second)));
}

#[tokio::test]
async fn test_app_config_lifecycle() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    session
        .create_app_config(AppConfig::new("tensile-analysis", workflow()).unwrap())
        .unwrap();
    let key = session.new_kitem("Specimen123", "specimen").unwrap();
    session
        .kitem_mut(key)
        .unwrap()
        .kitem_apps_mut()
        .push(App::new("tensile-analysis"))
        .unwrap();
    assert!(session.is_dirty());

    let report = session.commit().await.unwrap();
    assert_eq!(report.succeeded_with(OperationKind::CreateAppConfig).count(), 1);
    let requests = mock.requests();
    let upload = position(&requests, Method::Post, &routes::app_spec("tensile-analysis"));
    assert!(upload < position(&requests, Method::Post, routes::KITEMS));
    assert_eq!(requests[upload].query_value("overwrite"), Some("false"));
    assert_eq!(mock.app_spec("tensile-analysis").unwrap(), workflow());
    assert!(!session.is_dirty());

    let exposed = AppConfig::new("tensile-analysis", workflow())
        .unwrap()
        .with_sdk_config(true)
        .unwrap();
    session.update_app_config(exposed).unwrap();
    mock.clear_requests();
    session.commit().await.unwrap();
    assert_eq!(mock.requests()[0].query_value("overwrite"), Some("true"));
    let stored = mock.app_spec("tensile-analysis").unwrap();
    assert!(stored["spec"]["arguments"]["parameters"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["name"] == "host_url" && p["value"] == HOST));
    let fetched = session.fetch_app_config("tensile-analysis").await.unwrap();
    assert_eq!(fetched.specification, stored);

    session.delete_app_config("tensile-analysis").unwrap();
    mock.clear_requests();
    let report = session.commit().await.unwrap();
    assert!(mock.requests()[0].is(Method::Delete, &routes::app_spec("tensile-analysis")));
    assert_eq!(report.succeeded_with(OperationKind::DeleteAppConfig).count(), 1);
    assert!(mock.app_spec("tensile-analysis").is_none());
    assert!(session
        .fetch_app_config("tensile-analysis")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_taken_app_name_fails_alone_and_stays_staged() {
    let mock = mock_server();
    let mut session = connect(&mock).await;
    session
        .create_app_config(AppConfig::new("tensile", workflow()).unwrap())
        .unwrap();
    session.commit().await.unwrap();

    let replacement = json!({ "metadata": { "generateName": "tensile-v2-" } });
    let mut other = connect(&mock).await;
    other
        .create_app_config(AppConfig::new("tensile", replacement.clone()).unwrap())
        .unwrap();
    let key = other.new_kitem("Specimen123", "specimen").unwrap();

    let Err(DsmsError::PartialCommit(report)) = other.commit().await else {
        panic!("expected a partial commit");
    };
    let failure = report.failed_with(OperationKind::CreateAppConfig).next().unwrap();
    assert_eq!(failure.operation.target, "tensile");
    assert_eq!(failure.operation.kitem, None);
    assert!(failure.reason.contains("409"));
    assert_eq!(report.succeeded_with(OperationKind::CreateKItem).count(), 1);
    assert_eq!(other.state(key), Some(EntityState::Clean));
    assert!(other.is_dirty());
    assert_eq!(mock.app_spec("tensile").unwrap(), workflow());

    other.delete_app_config("tensile").unwrap();
    other
        .update_app_config(AppConfig::new("tensile", replacement.clone()).unwrap())
        .unwrap();
    let report = other.commit().await.unwrap();
    assert_eq!(report.succeeded_with(OperationKind::UpdateAppConfig).count(), 1);
    assert_eq!(mock.app_spec("tensile").unwrap(), replacement);
    assert!(!other.is_dirty());
}
