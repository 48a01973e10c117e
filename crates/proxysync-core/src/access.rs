//! Access-control collaborator.
//!
//! Only the call contract lives here; the decision logic belongs to the
//! security service of the hosting engine.

/// Operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AccessOperation {
    /// Receive publications from a destination (what a proxy subscription does)
    Receive,
}

/// Decides whether a principal may perform an operation on a destination.
pub trait AccessChecker: Send + Sync {
    /// Check access for `principal` to `destination` restricted by
    /// `discriminator` (the topic).
    fn check_access(
        &self,
        destination: &str,
        discriminator: &str,
        principal: &str,
        operation: AccessOperation,
    ) -> bool;
}

impl<F> AccessChecker for F
where
    F: Fn(&str, &str, &str, AccessOperation) -> bool + Send + Sync,
{
    fn check_access(
        &self,
        destination: &str,
        discriminator: &str,
        principal: &str,
        operation: AccessOperation,
    ) -> bool {
        self(destination, discriminator, principal, operation)
    }
}

/// Grants everything; for engines without a security service.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessChecker for AllowAll {
    fn check_access(&self, _: &str, _: &str, _: &str, _: AccessOperation) -> bool {
        true
    }
}
