use std::time::Duration;
use weavecore::{PendingInputError, PendingInputRegistry, Value};

#[tokio::test]
async fn test_resolve_delivers_value_exactly_once() {
    let registry = PendingInputRegistry::new();
    let waiter = registry.wait_for_input("mic").expect("first wait registers");

    assert!(registry.is_waiting("mic"));
    assert!(registry.resolve_input("mic", Value::from("recording")));
    // The registration is gone; a second delivery is a no-op.
    assert!(!registry.resolve_input("mic", Value::from("again")));

    assert_eq!(waiter.await, Some(Value::from("recording")));
    assert!(!registry.is_waiting("mic"));
}

#[tokio::test]
async fn test_resolve_without_waiter_is_noop() {
    let registry = PendingInputRegistry::new();
    assert!(!registry.resolve_input("nobody", Value::Null));
    assert!(registry.waiting_nodes().is_empty());
}

#[tokio::test]
async fn test_clear_releases_waiters_with_none() {
    let registry = PendingInputRegistry::new();
    let first = registry.wait_for_input("a").unwrap();
    let second = registry.wait_for_input("b").unwrap();
    assert_eq!(registry.waiting_nodes(), vec!["a".to_string(), "b".to_string()]);

    let waiting = tokio::spawn(async move { (first.await, second.await) });
    tokio::task::yield_now().await;

    assert_eq!(registry.clear(), 2);
    let (a, b) = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("waiters released")
        .unwrap();
    assert_eq!(a, None);
    assert_eq!(b, None);
    assert!(registry.waiting_nodes().is_empty());
}

#[tokio::test]
async fn test_second_wait_on_same_node_is_rejected() {
    let registry = PendingInputRegistry::new();
    let _first = registry.wait_for_input("mic").unwrap();

    match registry.wait_for_input("mic") {
        Err(PendingInputError::AlreadyWaiting(id)) => assert_eq!(id, "mic"),
        Ok(_) => panic!("duplicate wait must be rejected"),
    }
}

#[tokio::test]
async fn test_dropped_waiter_frees_the_slot() {
    let registry = PendingInputRegistry::new();
    let first = registry.wait_for_input("mic").unwrap();
    drop(first);

    assert!(!registry.is_waiting("mic"));
    let second = registry.wait_for_input("mic").expect("slot is free again");
    assert!(registry.resolve_input("mic", Value::Bool(true)));
    assert_eq!(second.await, Some(Value::Bool(true)));
}

#[tokio::test]
async fn test_old_waiter_drop_does_not_remove_new_registration() {
    let registry = PendingInputRegistry::new();
    let first = registry.wait_for_input("mic").unwrap();
    registry.clear();
    let second = registry.wait_for_input("mic").unwrap();

    // Dropping the stale handle must leave the newer one registered.
    drop(first);
    assert!(registry.is_waiting("mic"));
    assert!(registry.resolve_input("mic", Value::from("take two")));
    assert_eq!(second.await, Some(Value::from("take two")));
}
