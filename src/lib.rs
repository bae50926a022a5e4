//! Client SDK for the knowledge items of a DSMS instance
//!
//! Items are edited locally through change-tracked collections and sent to the
//! server in one ordered [`Session::commit`] pass.

pub mod apps;
pub mod commit;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod logging;
pub mod session;
pub mod transport;

pub use apps::AppConfig;
pub use commit::{CommitFailure, CommitOperation, CommitReport, OperationKind};
pub use config::Configuration;
pub use error::{DsmsError, Result};
pub use knowledge::{
    Affiliation, Annotation, App, Attachment, Column, Contact, CustomProperties, EntityState,
    ExternalLink, KItem, KType, LinkedKItem, UserGroup, Webform,
};
pub use session::{KItemKey, SearchHit, SearchQuery, Session};
pub use transport::{MockServer, Transport};
