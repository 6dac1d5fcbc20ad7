//! Tenant scoping.

use crate::id::TenantId;

/// Marks types that belong to exactly one tenant.
///
/// Stores use this to enforce isolation: a record fetched with the wrong
/// tenant is reported as a tenant isolation violation rather than returned.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;

    fn belongs_to(&self, tenant_id: TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}
