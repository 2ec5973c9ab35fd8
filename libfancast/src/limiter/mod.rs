//! Rate limiting for outbound platform calls
//!
//! Two independent layers gate every external call: the per-platform
//! API budget ([`platform::PlatformBudget`], in-process) and the
//! per-tenant subscription quota ([`tenant::TenantQuota`], backed by
//! the shared database). Both are checked before a call, and the
//! platform budget is only charged for attempts that the tenant quota
//! already cleared.

pub mod platform;
pub mod tenant;

pub use platform::{ApiAction, BudgetRule, PlatformBudget};
pub use tenant::{connected_platform_limit, QuotaAction, QuotaPeriod, TenantQuota};

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Calls left in the window after this one. Zero when denied.
    pub remaining: u32,
    /// How long until a denied caller should try again. Always
    /// positive on denial, zero on allow.
    pub retry_after_ms: u64,
}

impl Decision {
    pub fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_ms: 0,
        }
    }

    pub fn deny(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            // A denial always carries a usable wait hint.
            retry_after_ms: retry_after_ms.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denial_always_has_positive_retry_after() {
        assert!(Decision::deny(0).retry_after_ms > 0);
        assert_eq!(Decision::deny(5000).retry_after_ms, 5000);
        assert_eq!(Decision::allow(3).retry_after_ms, 0);
    }
}
