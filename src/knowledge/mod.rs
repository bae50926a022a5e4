//! Domain model: knowledge items, their sub-objects, and knowledge types

pub mod custom_properties;
pub mod kitem;
pub mod ktype;
pub mod patch;
pub mod properties;
pub mod timestamp;
pub mod tracked;
pub mod webform;

pub use custom_properties::{CustomProperties, MappingDiff, TrackedProperties};
pub use kitem::{slugify, AvatarUpload, EntityState, KItem, Scalars};
pub use ktype::{KType, KTypeRegistry};
pub use patch::{KItemPatch, SlotDiff};
pub use properties::{
    Affiliation, Annotation, App, AppProperties, Attachment, Column, Contact, ExternalLink,
    LinkedKItem, PropertyItem, UserGroup,
};
pub use tracked::TrackedList;
pub use webform::{Input, Webform, WebformSection, Widget};
