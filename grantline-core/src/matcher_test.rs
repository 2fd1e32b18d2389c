#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::error::LicensingError;
    use crate::matcher::GrantMatcher;
    use crate::test_support::{grant, key, request};
    use crate::types::{Grant, GrantStatus};

    fn pool(grants: Vec<Grant>) -> BTreeMap<String, Grant> {
        grants.into_iter().map(|g| (g.id.clone(), g)).collect()
    }

    #[test]
    fn test_first_free_grant_in_id_order() {
        let mut pending = grant("g2", "nodes", 5, "s2");
        pending.reserve(GrantStatus::Pending, &key("other"));
        let grants = pool(vec![grant("g3", "nodes", 5, "s3"), pending, grant("g1", "nodes", 3, "s1")]);
        let req = request("app", "db", "nodes", 2);

        let chosen = GrantMatcher::select(&key("app"), &req.spec, &grants).unwrap();
        assert_eq!(chosen.id, "g1");
    }

    #[test]
    fn test_skips_grants_held_by_other_requests() {
        let mut in_use = grant("g1", "nodes", 10, "s1");
        in_use.reserve(GrantStatus::InUse, &key("other"));
        let grants = pool(vec![in_use, grant("g2", "nodes", 10, "s2")]);
        let req = request("app", "db", "nodes", 2);

        let chosen = GrantMatcher::select(&key("app"), &req.spec, &grants).unwrap();
        assert_eq!(chosen.id, "g2");
    }

    #[test]
    fn test_own_reservation_is_offered_again() {
        let mut mine = grant("g1", "nodes", 4, "s1");
        mine.reserve(GrantStatus::Pending, &key("app"));
        let grants = pool(vec![mine]);
        let req = request("app", "db", "nodes", 4);

        let chosen = GrantMatcher::select(&key("app"), &req.spec, &grants).unwrap();
        assert_eq!(chosen.id, "g1");
    }

    #[test]
    fn test_unit_and_amount_must_match() {
        let grants = pool(vec![grant("g1", "cores", 64, "s1"), grant("g2", "nodes", 1, "s2")]);
        let req = request("app", "db", "nodes", 2);

        let err = GrantMatcher::select(&key("app"), &req.spec, &grants).unwrap_err();
        assert_eq!(
            err,
            LicensingError::NoMatchingGrant {
                unit: "nodes".to_string(),
                amount: 2
            }
        );
        assert_eq!(err.to_string(), "no free grant offers 2 nodes");
    }

    #[test]
    fn test_exact_amount_matches() {
        let grants = pool(vec![grant("g1", "nodes", 2, "s1")]);
        let req = request("app", "db", "nodes", 2);
        assert!(GrantMatcher::select(&key("app"), &req.spec, &grants).is_ok());
    }

    #[test]
    fn test_empty_pool() {
        let req = request("app", "db", "nodes", 1);
        assert!(GrantMatcher::select(&key("app"), &req.spec, &BTreeMap::new()).is_err());
    }
}
