//! Grace period for failed subscription payments
//!
//! A subscription keeps access for six months (180 days) after the first
//! failed payment of a dunning cycle. The clock is anchored to that first
//! failure; later failures in the same cycle count but never move it. The
//! first failure at or after the deadline suspends access. A successful
//! payment ends the cycle.

use time::{Duration, OffsetDateTime};

use crate::models::{PaymentFailureUpdate, SubscriptionRecord};

pub const GRACE_PERIOD_DAYS: i64 = 180;

/// Days per month used when rendering the remaining grace period
const DAYS_PER_MONTH: i64 = 30;

/// Result of applying one failed payment to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    pub update: PaymentFailureUpdate,
    /// Access was suspended by this failure
    pub newly_suspended: bool,
    pub days_remaining: i64,
    pub months_remaining: i64,
}

/// Apply a failed payment at `now` to the subscription's dunning state
pub fn register_failure(subscription: &SubscriptionRecord, now: OffsetDateTime) -> FailureOutcome {
    let anchor = subscription.last_payment_failure_at.unwrap_or(now);
    let elapsed = now - anchor;
    let deadline_reached = elapsed >= Duration::days(GRACE_PERIOD_DAYS);

    let newly_suspended = deadline_reached && !subscription.access_suspended;
    let access_suspended_at = if newly_suspended {
        Some(now)
    } else {
        subscription.access_suspended_at
    };

    let days_remaining = (GRACE_PERIOD_DAYS - elapsed.whole_days()).max(0);

    FailureOutcome {
        update: PaymentFailureUpdate {
            payment_failure_count: subscription.payment_failure_count.saturating_add(1),
            last_payment_failure_at: Some(anchor),
            access_suspended: subscription.access_suspended || deadline_reached,
            access_suspended_at,
        },
        newly_suspended,
        days_remaining,
        months_remaining: days_remaining / DAYS_PER_MONTH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use uuid::Uuid;

    const T0: OffsetDateTime = datetime!(2026-01-01 12:00 UTC);

    fn subscription() -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            gallery_id: None,
            stripe_subscription_id: "sub_1".into(),
            stripe_customer_id: Some("cus_1".into()),
            status: "active".into(),
            plan_type: "monthly".into(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            payment_failure_count: 0,
            last_payment_failure_at: None,
            access_suspended: false,
            access_suspended_at: None,
            created_at: T0 - Duration::days(400),
        }
    }

    fn apply(sub: &mut SubscriptionRecord, at: OffsetDateTime) -> FailureOutcome {
        let outcome = register_failure(sub, at);
        sub.payment_failure_count = outcome.update.payment_failure_count;
        sub.last_payment_failure_at = outcome.update.last_payment_failure_at;
        sub.access_suspended = outcome.update.access_suspended;
        sub.access_suspended_at = outcome.update.access_suspended_at;
        outcome
    }

    #[test]
    fn test_first_failure_starts_clock_with_full_grace() {
        let mut sub = subscription();
        let outcome = apply(&mut sub, T0);

        assert_eq!(outcome.update.payment_failure_count, 1);
        assert_eq!(outcome.update.last_payment_failure_at, Some(T0));
        assert!(!outcome.update.access_suspended);
        assert_eq!(outcome.days_remaining, 180);
        assert_eq!(outcome.months_remaining, 6);
    }

    #[test]
    fn test_suspension_boundary() {
        let mut sub = subscription();
        apply(&mut sub, T0);

        let just_before = T0 + Duration::days(180) - Duration::seconds(1);
        let outcome = apply(&mut sub, just_before);
        assert!(!outcome.update.access_suspended);
        assert_eq!(outcome.days_remaining, 1);

        let at_deadline = T0 + Duration::days(180);
        let outcome = apply(&mut sub, at_deadline);
        assert!(outcome.newly_suspended);
        assert!(outcome.update.access_suspended);
        assert_eq!(outcome.update.access_suspended_at, Some(at_deadline));
        assert_eq!(outcome.days_remaining, 0);
    }

    #[test]
    fn test_clock_does_not_reset_on_repeat_failures() {
        let mut sub = subscription();
        apply(&mut sub, T0);
        let second = apply(&mut sub, T0 + Duration::days(10));
        assert_eq!(second.update.last_payment_failure_at, Some(T0));
        assert_eq!(second.days_remaining, 170);

        let third = apply(&mut sub, T0 + Duration::days(185));
        assert!(third.update.access_suspended);
        assert_eq!(third.update.payment_failure_count, 3);
    }

    #[test]
    fn test_fifth_failure_at_day_200_suspends() {
        let mut sub = subscription();
        sub.payment_failure_count = 4;
        sub.last_payment_failure_at = Some(T0);

        let outcome = register_failure(&sub, T0 + Duration::days(200));
        assert_eq!(outcome.update.payment_failure_count, 5);
        assert!(outcome.update.access_suspended);
        assert!(outcome.update.access_suspended_at.is_some());
    }

    #[test]
    fn test_already_suspended_keeps_original_suspension_time() {
        let mut sub = subscription();
        let suspended_at = T0 + Duration::days(181);
        sub.payment_failure_count = 7;
        sub.last_payment_failure_at = Some(T0);
        sub.access_suspended = true;
        sub.access_suspended_at = Some(suspended_at);

        let outcome = register_failure(&sub, T0 + Duration::days(240));
        assert!(!outcome.newly_suspended);
        assert!(outcome.update.access_suspended);
        assert_eq!(outcome.update.access_suspended_at, Some(suspended_at));
    }

    #[test]
    fn test_months_round_down() {
        let mut sub = subscription();
        sub.last_payment_failure_at = Some(T0);
        let outcome = register_failure(&sub, T0 + Duration::days(31));
        assert_eq!(outcome.days_remaining, 149);
        assert_eq!(outcome.months_remaining, 4);
    }
}
