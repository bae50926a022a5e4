//! Route layout of the DSMS REST API

use std::fmt::Display;

pub const PING: &str = "api/knowledge/docs";
pub const TOKEN: &str = "api/users/token";
pub const KITEMS: &str = "api/knowledge/kitems";
pub const KITEM_SEARCH: &str = "api/knowledge/kitems/search";
pub const KTYPES: &str = "api/knowledge-type/";
pub const SPARQL_QUERY: &str = "api/knowledge/sparql";
pub const SPARQL_UPDATE: &str = "api/knowledge/update-query";
pub const ADD_RDF: &str = "api/knowledge/add-rdf";

pub fn kitem(id: impl Display) -> String {
    format!("{}/{}", KITEMS, id)
}

pub fn attachments(kitem_id: impl Display) -> String {
    format!("api/knowledge/attachments/{}", kitem_id)
}

pub fn attachment(kitem_id: impl Display, name: &str) -> String {
    format!("api/knowledge/attachments/{}/{}", kitem_id, name)
}

pub fn dataframe(kitem_id: impl Display) -> String {
    format!("api/knowledge/data/{}", kitem_id)
}

pub fn dataframe_column(kitem_id: impl Display, column_id: usize) -> String {
    format!("api/knowledge/data/{}/column-{}", kitem_id, column_id)
}

pub fn avatar(kitem_id: impl Display) -> String {
    format!("api/knowledge/avatar/{}", kitem_id)
}

pub fn ktype(id: &str) -> String {
    format!("{}{}", KTYPES, id)
}

pub fn app_spec(name: &str) -> String {
    format!("api/knowledge/apps/argo/spec/{}", name)
}
