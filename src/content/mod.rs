pub mod arch;
pub mod model;
pub mod paths;
pub mod regeneration;

pub use model::{entitlement_content_ids, entitlement_products, MappingContext};
pub use paths::{winner, ContentPathBuilder, PromotedContent, PromotionScope};
pub use regeneration::{
    detect_dirty_entitlements, EntitlementContent, EnvironmentPromotions, Winner,
};
