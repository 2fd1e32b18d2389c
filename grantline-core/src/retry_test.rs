#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::LicensingError;
    use crate::retry::{retry_on_conflict, BackoffConfig, RetryPolicy};
    use crate::types::{ObjectKey, ResourceKind};

    fn conflict() -> LicensingError {
        LicensingError::Conflict {
            kind: ResourceKind::Entitlement,
            key: ObjectKey::new("ns", "db"),
        }
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = BackoffConfig::Exponential {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(50));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_millis(50));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffConfig::Fixed { delay_ms: 7 };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(7));
        assert_eq!(backoff.delay_for_attempt(9), Duration::from_millis(7));
    }

    #[test]
    fn test_conflicts_are_retried_until_success() {
        let mut calls = 0;
        let result = retry_on_conflict(&RetryPolicy::immediate(5), || {
            calls += 1;
            if calls < 3 { Err(conflict()) } else { Ok(calls) }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_attempt_budget_is_bounded() {
        let mut calls = 0;
        let result: Result<(), _> = retry_on_conflict(&RetryPolicy::immediate(4), || {
            calls += 1;
            Err(conflict())
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = retry_on_conflict(&RetryPolicy::immediate(4), || {
            calls += 1;
            Err(LicensingError::Store("backend down".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_policy_deserializes_from_json() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 3, "backoff": {"type": "exponential", "initial_delay_ms": 5, "max_delay_ms": 100}}"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(
            policy.backoff,
            BackoffConfig::Exponential {
                initial_delay_ms: 5,
                max_delay_ms: 100,
                multiplier: 2.0
            }
        );
    }

    #[test]
    fn test_requeue_classification() {
        assert!(conflict().is_requeueable());
        assert!(LicensingError::Store("x".to_string()).is_requeueable());
        assert!(!LicensingError::Unlabeled(ObjectKey::new("ns", "s")).is_requeueable());
    }
}
