use crate::identity::model::ServiceIdentity;
use async_trait::async_trait;

/// One pass over the identities in this gateway's scope, a page at a time.
/// `None` ends the iteration; service errors surface as an early end, never
/// as failures.
#[async_trait]
pub trait IdentityPager: Send {
    async fn next(&mut self) -> Option<Vec<ServiceIdentity>>;
}

/// Client of the remote identity service
#[async_trait]
pub trait ServiceProxy: Send + Sync {
    /// Start a paginated enumeration of the gateway's scope
    fn identities(&self) -> Box<dyn IdentityPager>;

    /// Targeted lookup of one device or module identity. `None` means out of
    /// scope or service unreachable.
    async fn get_identity(
        &self,
        device_id: &str,
        module_id: Option<&str>,
    ) -> Option<ServiceIdentity>;
}
