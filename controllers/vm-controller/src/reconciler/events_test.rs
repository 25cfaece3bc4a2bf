//! Unit tests for watch event handling

#[cfg(test)]
mod tests {
    use crate::reconciler::ResourceStatus;
    use crate::test_utils::*;
    use kubevirt_client::{
        ClusterError, ClusterPhase, MockOperation, ResourceId, SpecFingerprint, WatchEvent,
        WatchEventKind,
    };
    use std::collections::BTreeSet;

    async fn deliver(h: &TestHarness, id: &ResourceId, kind: WatchEventKind) {
        let event = h.cluster.event(id, kind).unwrap();
        h.reconciler.handle_event(event).await;
    }

    async fn create(h: &TestHarness, name: &str) -> ResourceId {
        h.reconciler
            .create(create_test_spec(name), "alice".to_string())
            .await
            .unwrap()
            .id
    }

    fn drifted() -> SpecFingerprint {
        SpecFingerprint {
            cpu_cores: 16,
            ..create_test_spec("web").fingerprint()
        }
    }

    async fn resync(h: &TestHarness, id: &ResourceId) {
        let observed = h.cluster.observed(id).unwrap();
        h.reconciler.handle_event(WatchEvent::synthetic(id.clone(), observed)).await;
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let h = create_test_harness(2);
        h.cluster.insert(&create_test_spec("stranger"), "mallory");
        let id = ResourceId::new("vms", "stranger");

        // Live events never adopt, even for labelled objects
        deliver(&h, &id, WatchEventKind::Added).await;
        assert!(h.reconciler.status(&id).is_none());
        assert!(h.reconciler.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_unlabelled_vm_is_not_adopted() {
        let h = create_test_harness(2);
        h.cluster.insert_unmanaged(&create_test_spec("foreign"));
        let id = ResourceId::new("vms", "foreign");

        resync(&h, &id).await;
        assert!(h.reconciler.status(&id).is_none());
    }

    #[tokio::test]
    async fn test_labelled_vm_is_adopted_on_resync() {
        let h = create_test_harness(2);
        h.cluster.insert(&create_test_spec("web"), "bob");
        let id = ResourceId::new("vms", "web");
        h.host.add_link("tap-web");
        h.cluster.set_network_identity(&id, create_test_identity("tap-web"));
        h.cluster.set_ready(&id);

        resync(&h, &id).await;

        let record = h.reconciler.status(&id).unwrap();
        assert_eq!(record.owner, "bob");
        assert_eq!(record.status, ResourceStatus::Running);
        assert_eq!(record.desired.fingerprint(), create_test_spec("web").fingerprint());
        assert_eq!(record.uid, h.cluster.observed(&id).unwrap().uid);
        assert!(h.bridge.binding(&id).await.is_some());
        assert_eq!(h.cluster.calls(MockOperation::Replace), 0);

        // A second resync of the same object is an ordinary update
        resync(&h, &id).await;
        assert_eq!(h.reconciler.list(None).len(), 1);
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Running);
    }

    #[tokio::test]
    async fn test_resync_tombstones_vm_missing_from_list() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        h.host.add_link("tap-web");
        h.cluster.set_network_identity(&id, create_test_identity("tap-web"));
        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Running);

        // The Deleted event is never delivered
        h.cluster.remove_externally(&id);
        let deleted = h.reconciler.handle_resync("vms", &BTreeSet::new()).await;

        assert_eq!(deleted, 1);
        let record = h.reconciler.status(&id).unwrap();
        assert_eq!(record.status, ResourceStatus::Deleted);
        assert!(record.assigned_interface.is_none());
        assert_eq!(h.bridge.binding_count().await, 0);
        assert_eq!(h.host.controller_of("tap-web"), None);
    }

    #[tokio::test]
    async fn test_resync_keeps_vm_that_still_exists() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        let other = create(&h, "db").await;

        // `web` was created after the list was taken
        let listed = BTreeSet::from([other.clone()]);
        assert_eq!(h.reconciler.handle_resync("vms", &listed).await, 0);
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Pending);
        assert_eq!(h.cluster.calls(MockOperation::Get), 1);

        // Other namespaces are not touched
        h.cluster.remove_externally(&id);
        assert_eq!(h.reconciler.handle_resync("other", &BTreeSet::new()).await, 0);
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Pending);
    }

    #[tokio::test]
    async fn test_resync_keeps_vm_when_absence_is_unconfirmed() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        h.cluster.remove_externally(&id);
        h.cluster.fail_next(MockOperation::Get, ClusterError::Unreachable("down".into()));

        assert_eq!(h.reconciler.handle_resync("vms", &BTreeSet::new()).await, 0);
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Pending);

        assert_eq!(h.reconciler.handle_resync("vms", &BTreeSet::new()).await, 1);
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Deleted);
    }

    #[tokio::test]
    async fn test_added_modified_deleted_ends_deleted() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        h.host.add_link("tap-web");
        h.cluster.set_network_identity(&id, create_test_identity("tap-web"));

        deliver(&h, &id, WatchEventKind::Added).await;
        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Running);

        let last_seen = h.cluster.observed(&id).unwrap();
        h.cluster.remove_externally(&id);
        h.reconciler
            .handle_event(WatchEvent::new(WatchEventKind::Deleted, id.clone(), last_seen))
            .await;

        let record = h.reconciler.status(&id).unwrap();
        assert_eq!(record.status, ResourceStatus::Deleted);
        assert!(record.assigned_interface.is_none());
        assert!(h.bridge.binding(&id).await.is_none());
        assert_eq!(h.host.controller_of("tap-web"), None);
    }

    #[tokio::test]
    async fn test_events_after_tombstone_are_ignored() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        let mut late = h.cluster.event(&id, WatchEventKind::Modified).unwrap();
        h.reconciler
            .handle_event(WatchEvent::new(WatchEventKind::Deleted, id.clone(), late.observed.clone()))
            .await;

        late.observed.phase = ClusterPhase::Ready;
        h.reconciler.handle_event(late).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Deleted);
        assert_eq!(h.cluster.calls(MockOperation::NetworkIdentity), 0);
    }

    #[tokio::test]
    async fn test_event_for_other_object_is_ignored() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        let mut foreign = h.cluster.event(&id, WatchEventKind::Deleted).unwrap();
        foreign.observed.uid = Some("some-older-object".to_string());

        h.reconciler.handle_event(foreign).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Pending);
    }

    #[tokio::test]
    async fn test_ready_without_identity_stays_pending() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Pending);

        // The interface shows up later; the maintenance pass promotes it
        h.host.add_link("tap-web");
        h.cluster.set_network_identity(&id, create_test_identity("tap-web"));
        assert_eq!(h.reconciler.retry_pending_network().await, 1);

        let record = h.reconciler.status(&id).unwrap();
        assert_eq!(record.status, ResourceStatus::Running);
        assert_eq!(record.assigned_interface.unwrap().interface_name, "tap-web");
        assert_eq!(record.network.unwrap().ip_address.as_deref(), Some("10.0.0.10"));
    }

    #[tokio::test]
    async fn test_missing_host_link_stays_pending() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        h.cluster.set_network_identity(&id, create_test_identity("tap-web"));
        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;

        let record = h.reconciler.status(&id).unwrap();
        assert_eq!(record.status, ResourceStatus::Pending);
        assert!(record.last_error.unwrap().contains("tap-web"));
    }

    #[tokio::test]
    async fn test_not_ready_keeps_binding() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        h.host.add_link("tap-web");
        h.cluster.set_network_identity(&id, create_test_identity("tap-web"));
        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;
        let bound = h.bridge.binding(&id).await.unwrap();

        h.cluster.set_phase(&id, ClusterPhase::NotReady);
        deliver(&h, &id, WatchEventKind::Modified).await;
        let record = h.reconciler.status(&id).unwrap();
        assert_eq!(record.status, ResourceStatus::Pending);
        assert_eq!(record.assigned_interface.as_ref(), Some(&bound));

        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Running);
        assert_eq!(h.bridge.binding(&id).await.unwrap(), bound);
    }

    #[tokio::test]
    async fn test_cluster_failure_releases_binding() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        h.host.add_link("tap-web");
        h.cluster.set_network_identity(&id, create_test_identity("tap-web"));
        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;

        h.cluster.set_phase(&id, ClusterPhase::Failed);
        deliver(&h, &id, WatchEventKind::Modified).await;

        let record = h.reconciler.status(&id).unwrap();
        assert_eq!(record.status, ResourceStatus::Failed);
        assert!(record.assigned_interface.is_none());
        assert_eq!(h.bridge.binding_count().await, 0);
    }

    #[tokio::test]
    async fn test_cluster_failure_recovers() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        h.host.add_link("tap-web");
        h.cluster.set_network_identity(&id, create_test_identity("tap-web"));
        h.cluster.set_phase(&id, ClusterPhase::Failed);
        deliver(&h, &id, WatchEventKind::Modified).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Failed);

        // Still failing: nothing changes
        deliver(&h, &id, WatchEventKind::Modified).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Failed);

        h.cluster.set_phase(&id, ClusterPhase::Provisioning);
        deliver(&h, &id, WatchEventKind::Modified).await;
        let record = h.reconciler.status(&id).unwrap();
        assert_eq!(record.status, ResourceStatus::Pending);
        assert!(record.last_error.is_none());

        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Running);
        assert_eq!(h.bridge.binding_count().await, 1);
    }

    #[tokio::test]
    async fn test_own_write_echo_is_not_drift() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        // The Added event produced by our own apply
        let mut echo = h.cluster.event(&id, WatchEventKind::Added).unwrap();
        echo.observed.fingerprint = Some(drifted());

        h.reconciler.handle_event(echo).await;
        assert_eq!(h.cluster.calls(MockOperation::Replace), 0);
        assert_eq!(h.reconciler.status(&id).unwrap().drift_attempts, 0);
    }

    #[tokio::test]
    async fn test_drift_is_repaired() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;

        h.cluster.drift(&id, drifted());
        deliver(&h, &id, WatchEventKind::Modified).await;

        assert_eq!(h.cluster.calls(MockOperation::Replace), 1);
        let observed = h.cluster.observed(&id).unwrap();
        assert_eq!(observed.fingerprint, Some(create_test_spec("web").fingerprint()));
        assert_eq!(h.reconciler.status(&id).unwrap().drift_attempts, 1);

        // A later matching observation resets the counter
        h.cluster.set_phase(&id, ClusterPhase::Provisioning);
        deliver(&h, &id, WatchEventKind::Modified).await;
        assert_eq!(h.reconciler.status(&id).unwrap().drift_attempts, 0);
    }

    #[tokio::test]
    async fn test_drift_exhaustion_fails_resource() {
        let h = create_test_harness(2);
        let id = create(&h, "web").await;
        h.host.add_link("tap-web");
        h.cluster.set_network_identity(&id, create_test_identity("tap-web"));
        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;

        for _ in 0..3 {
            h.cluster.drift(&id, drifted());
            deliver(&h, &id, WatchEventKind::Modified).await;
        }

        let record = h.reconciler.status(&id).unwrap();
        assert_eq!(record.status, ResourceStatus::Failed);
        assert!(record.repair_exhausted);
        assert!(record.last_error.unwrap().contains("Reconciliation exhausted"));
        assert_eq!(h.cluster.calls(MockOperation::Replace), 2);
        assert_eq!(h.bridge.binding_count().await, 0);

        // A healthy-looking observation does not revive it
        h.cluster.set_ready(&id);
        deliver(&h, &id, WatchEventKind::Modified).await;
        assert_eq!(h.reconciler.status(&id).unwrap().status, ResourceStatus::Failed);
        assert_eq!(h.bridge.binding_count().await, 0);
    }
}
