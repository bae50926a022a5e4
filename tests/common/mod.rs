#![allow(dead_code)]

use dsms_sdk::config::Configuration;
use dsms_sdk::{MockServer, Session};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub const HOST: &str = "https://dsms.test";

pub fn specimen_ktype() -> Value {
    json!({
        "id": "specimen",
        "name": "Specimen",
        "webform": {
            "sections": [{
                "id": "section1",
                "name": "Dimensions",
                "inputs": [
                    { "id": "input1", "label": "Width", "widget": "Number" },
                    { "id": "input2", "label": "Length", "widget": "Number" },
                    { "id": "input3", "label": "Material", "widget": "Text" }
                ]
            }]
        }
    })
}

pub fn mock_server() -> Arc<MockServer> {
    Arc::new(
        MockServer::new()
            .with_ktype(specimen_ktype())
            .with_ktype(json!({ "id": "machine", "name": "Machine" })),
    )
}

pub fn test_config() -> Configuration {
    let mut config = Configuration::new(HOST).with_token("test-token");
    config.individual_slugs = false;
    config
}

pub async fn connect(mock: &Arc<MockServer>) -> Session {
    connect_with(mock, test_config()).await
}

pub async fn connect_with(mock: &Arc<MockServer>, config: Configuration) -> Session {
    let session = Session::with_transport(config, mock.clone())
        .await
        .unwrap();
    mock.clear_requests();
    session
}

/// Store an item on the mock and return its id
pub fn seed_kitem(mock: &MockServer, name: &str, ktype_id: &str) -> String {
    mock.insert_kitem(json!({
        "name": name,
        "slug": name.to_lowercase().replace(' ', ""),
        "ktype_id": ktype_id,
    }))
}

pub fn uuid(id: &str) -> Uuid {
    Uuid::parse_str(id).unwrap()
}
