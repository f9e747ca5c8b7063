pub mod cache;
pub mod hierarchy;
pub mod model;
pub mod proxy;

pub use cache::{IdentityChange, ScopeCache};
pub use hierarchy::IdentityHierarchy;
pub use model::{
    split_module_id, AuthChain, AuthType, IdentityKind, IdentityStatus, ServiceIdentity,
    StoredIdentity,
};
pub use proxy::{IdentityPager, ServiceProxy};
