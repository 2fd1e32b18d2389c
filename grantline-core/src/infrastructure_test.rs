#[cfg(test)]
mod tests {
    use crate::error::LicensingError;
    use crate::infrastructure::{update_status_with, update_with, ResourceStore, Selector, WatchEvent};
    use crate::infrastructure_in_memory::InMemoryStore;
    use crate::retry::RetryPolicy;
    use crate::test_support::{grant, key, request, NS};
    use crate::types::{Entitlement, ObjectMeta, Request, RequestPhase, Secret, LICENSE_LABEL};

    #[test]
    fn test_in_memory_store_create_and_get() {
        let store = InMemoryStore::new();
        let created = store.create(Entitlement::new(NS, "db")).unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert!(created.metadata.resource_version > 0);

        let fetched: Entitlement = store.get(&key("db")).unwrap();
        assert_eq!(fetched, created);

        let err = store.create(Entitlement::new(NS, "db")).unwrap_err();
        assert!(matches!(err, LicensingError::AlreadyExists { .. }));
    }

    #[test]
    fn test_in_memory_store_missing_object() {
        let store = InMemoryStore::new();
        let err = ResourceStore::<Request>::get(&store, &key("nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_stale_version_conflicts() {
        let store = InMemoryStore::new();
        let created = store.create(Entitlement::new(NS, "db")).unwrap();

        let mut first = created.clone();
        first.status.grants.insert("g1".into(), grant("g1", "nodes", 1, "s1"));
        store.update_status(first).unwrap();

        let mut stale = created;
        stale.status.grants.insert("g2".into(), grant("g2", "nodes", 1, "s2"));
        let err = store.update_status(stale).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_update_keeps_status_and_update_status_keeps_spec() {
        let store = InMemoryStore::new();
        let created = store.create(request("app", "db", "nodes", 1)).unwrap();

        let mut offered = created.clone();
        offered.status.phase = RequestPhase::Offer;
        offered.spec.amount = 99;
        let offered = store.update_status(offered).unwrap();
        assert_eq!(offered.status.phase, RequestPhase::Offer);
        assert_eq!(offered.spec.amount, 1);

        let mut respec = offered.clone();
        respec.spec.amount = 2;
        respec.status.phase = RequestPhase::Discover;
        let respec = store.update(respec).unwrap();
        assert_eq!(respec.spec.amount, 2);
        assert_eq!(respec.status.phase, RequestPhase::Offer);
    }

    #[test]
    fn test_delete_without_finalizers_removes() {
        let store = InMemoryStore::new();
        let mut events = ResourceStore::<Request>::watch(&store);
        store.create(request("app", "db", "nodes", 1)).unwrap();
        ResourceStore::<Request>::delete(&store, &key("app")).unwrap();

        assert!(matches!(events.try_recv().unwrap(), WatchEvent::Applied(_)));
        assert!(matches!(events.try_recv().unwrap(), WatchEvent::Deleted(_)));
        assert!(ResourceStore::<Request>::get(&store, &key("app")).is_err());
    }

    #[test]
    fn test_finalizer_holds_tombstone_until_released() {
        let store = InMemoryStore::new();
        let mut req = request("app", "db", "nodes", 1);
        req.metadata.add_finalizer("test/hold");
        store.create(req).unwrap();

        let mut events = ResourceStore::<Request>::watch(&store);
        ResourceStore::<Request>::delete(&store, &key("app")).unwrap();
        let tombstone: Request = store.get(&key("app")).unwrap();
        assert!(tombstone.metadata.is_deleting());
        assert!(matches!(events.try_recv().unwrap(), WatchEvent::Applied(_)));

        // A second delete is a no-op.
        ResourceStore::<Request>::delete(&store, &key("app")).unwrap();

        let mut released = tombstone;
        released.metadata.remove_finalizer("test/hold");
        store.update(released).unwrap();
        assert!(matches!(events.try_recv().unwrap(), WatchEvent::Deleted(_)));
        assert!(ResourceStore::<Request>::get(&store, &key("app")).is_err());
    }

    #[test]
    fn test_label_selector() {
        let store = InMemoryStore::new();
        store.create(Secret::license(NS, "lic", "token")).unwrap();
        store.create(Secret::new(ObjectMeta::new(NS, "plain"))).unwrap();
        store.create(Secret::license("elsewhere", "lic", "token")).unwrap();

        let labeled: Vec<Secret> = store
            .list(&Selector::namespace(NS).with_label(LICENSE_LABEL))
            .unwrap();
        assert_eq!(labeled.len(), 1);
        assert_eq!(labeled[0].metadata.name, "lic");

        let all: Vec<Secret> = store.list(&Selector::all()).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_update_with_skips_unchanged() {
        let (_, stores) = InMemoryStore::shared();
        let created = stores.requests.create(request("app", "db", "nodes", 1)).unwrap();
        let policy = RetryPolicy::immediate(3);

        let skipped = update_with(stores.requests.as_ref(), &key("app"), &policy, |_| Ok(false)).unwrap();
        assert!(skipped.is_none());
        assert_eq!(
            stores.requests.get(&key("app")).unwrap().metadata.resource_version,
            created.metadata.resource_version
        );

        let written = update_status_with(stores.requests.as_ref(), &key("app"), &policy, |r| {
            r.status.message = Some("hello".to_string());
            Ok(true)
        })
        .unwrap();
        assert_eq!(written.unwrap().status.message.as_deref(), Some("hello"));
    }
}
