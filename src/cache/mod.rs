pub mod anonymous;
pub mod content_access;

pub use anonymous::{AnonymousCertContent, AnonymousContentCache, LruAnonymousContentCache};
pub use content_access::{payload_key, ContentAccessPayloadCache};
