pub mod cache;
pub mod config;
pub mod content;
pub mod error;
pub mod lifecycle;
pub mod pki;
pub mod storage;
pub mod types;

pub use config::Config;
pub use error::{EntitlementError, Result};
pub use lifecycle::{CertificateLifecycleManager, CertificateRole, CertificateState, Collaborators};
