use casesync_sync::network::next_transition;
use casesync_sync::{Connectivity, NetworkMonitor};
use std::time::Duration;

#[test]
fn default_is_online() {
    let monitor = NetworkMonitor::default();
    assert!(monitor.is_online());
    assert_eq!(monitor.connectivity(), Connectivity::Online);
}

#[test]
fn repeated_signals_are_ignored() {
    let monitor = NetworkMonitor::default();
    assert!(!monitor.set(Connectivity::Online));
    assert!(monitor.set_online(false));
    assert!(!monitor.set_online(false));
    assert!(monitor.set_online(true));
}

#[test]
fn clones_share_the_flag() {
    let monitor = NetworkMonitor::default();
    let clone = monitor.clone();
    clone.set_online(false);
    assert!(!monitor.is_online());
}

#[tokio::test]
async fn subscribers_see_transitions_only() {
    let monitor = NetworkMonitor::default();
    let mut rx = monitor.subscribe();

    monitor.set_online(true);
    monitor.set_online(false);
    assert_eq!(next_transition(&mut rx).await, Connectivity::Offline);

    let pending = tokio::time::timeout(Duration::from_millis(50), next_transition(&mut rx)).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn wait_online_returns_after_reconnect() {
    let monitor = NetworkMonitor::new(Connectivity::Offline);
    let waiter = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.wait_online().await })
    };

    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    monitor.set_online(true);
    waiter.await.unwrap();
}
