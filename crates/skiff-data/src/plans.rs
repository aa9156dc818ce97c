//! Plan descriptors and resolution.
//!
//! Plans are compiled-in value objects keyed by name. They are immutable:
//! changing a user's plan never re-dates already-completed torrents.

use crate::models::{Role, Subscription};

/// Quota and retention descriptor for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    /// Plan name as referenced by subscription rows.
    pub name: &'static str,
    /// Monthly transfer allowance in bytes; `None` is unlimited.
    pub limit_bytes_per_month: Option<i64>,
    /// Maximum simultaneously active (pending/downloading) torrents.
    pub concurrent_limit: i64,
    /// Days completed content is retained before the sweeper removes it.
    pub retention_days: i64,
}

const GIB: i64 = 1024 * 1024 * 1024;

/// Default plan for users without a subscription.
pub const FREE: Plan = Plan {
    name: "free",
    limit_bytes_per_month: Some(10 * GIB),
    concurrent_limit: 1,
    retention_days: 1,
};

/// Paid plan.
pub const PREMIUM: Plan = Plan {
    name: "premium",
    limit_bytes_per_month: None,
    concurrent_limit: 5,
    retention_days: 30,
};

/// Trial plan.
pub const DEMO: Plan = Plan {
    name: "demo",
    limit_bytes_per_month: Some(GIB),
    concurrent_limit: 1,
    retention_days: 1,
};

/// Operator plan.
pub const ADMIN: Plan = Plan {
    name: "admin",
    limit_bytes_per_month: None,
    concurrent_limit: 100,
    retention_days: 365,
};

/// Look a plan up by name; unknown names fall back to [`FREE`].
#[must_use]
pub fn by_name(name: &str) -> Plan {
    match name {
        "premium" => PREMIUM,
        "demo" => DEMO,
        "admin" => ADMIN,
        _ => FREE,
    }
}

/// Resolve the effective plan for a user from their role and optional
/// subscription. Role wins for operator and trial accounts; otherwise an
/// active subscription decides, with [`FREE`] as the floor.
#[must_use]
pub fn resolve(role: Role, subscription: Option<&Subscription>) -> Plan {
    match role {
        Role::Admin => ADMIN,
        Role::Demo => DEMO,
        Role::Premium => PREMIUM,
        Role::User => subscription
            .filter(|sub| sub.status == "active")
            .map_or(FREE, |sub| by_name(&sub.plan_name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn subscription(plan: &str, status: &str) -> Subscription {
        Subscription {
            user_id: Uuid::new_v4(),
            plan_name: plan.to_string(),
            status: status.to_string(),
            period_end: None,
        }
    }

    #[test]
    fn role_overrides_win() {
        assert_eq!(resolve(Role::Admin, None), ADMIN);
        assert_eq!(resolve(Role::Demo, Some(&subscription("premium", "active"))), DEMO);
        assert_eq!(resolve(Role::Premium, None), PREMIUM);
    }

    #[test]
    fn plain_users_resolve_through_subscription() {
        assert_eq!(resolve(Role::User, None), FREE);
        assert_eq!(
            resolve(Role::User, Some(&subscription("premium", "active"))),
            PREMIUM
        );
        assert_eq!(
            resolve(Role::User, Some(&subscription("premium", "past_due"))),
            FREE
        );
    }

    #[test]
    fn unknown_plan_names_fall_back_to_free() {
        assert_eq!(by_name("platinum"), FREE);
    }

    #[test]
    fn free_plan_matches_published_limits() {
        assert_eq!(FREE.concurrent_limit, 1);
        assert_eq!(FREE.retention_days, 1);
        assert_eq!(FREE.limit_bytes_per_month, Some(10 * GIB));
    }
}
