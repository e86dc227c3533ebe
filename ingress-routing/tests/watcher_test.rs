//! Lifecycle watcher tests.
//!
//! Events are queued on the fake platform and the stream is closed
//! afterwards, so `run` returns once every event has been handled.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ingress_routing::config::ServiceFilter;
use ingress_routing::error::Error;
use ingress_routing::platform::ContainerStart;
use ingress_routing::registry::{GatewayEntry, IdMode, Registry};
use ingress_routing::return_path::{MARKER_COMMENT, ReturnPathInstaller};
use ingress_routing::test_util::{FakeNamespace, FakePlatform};
use ingress_routing::topology::IngressTopology;
use ingress_routing::watcher::Watcher;

fn topology() -> IngressTopology {
    IngressTopology {
        subnet: "10.0.0.0/24".parse().unwrap(),
        node_addr: Ipv4Addr::new(10, 0, 0, 2),
    }
}

fn watcher(platform: &Arc<FakePlatform>, services: ServiceFilter, backfill: bool) -> Watcher<FakePlatform> {
    let registry = Registry::resolve(
        &[GatewayEntry::Active(Ipv4Addr::new(10, 0, 0, 2))],
        IdMode::Octet,
    )
    .unwrap();
    let installer = ReturnPathInstaller::new(&topology(), &registry, services);
    Watcher::new(Arc::clone(platform), installer, backfill).with_retry(3, Duration::ZERO)
}

fn attached(label: &str) -> FakeNamespace {
    FakeNamespace::new(label)
        .with_addr("eth1", "10.0.0.9/24")
        .with_sysctl("net.ipv4.conf.all.rp_filter", "1")
        .with_sysctl("net.ipv4.conf.eth1.rp_filter", "1")
}

fn configured(ns: &FakeNamespace) -> bool {
    ns.firewall_rules()
        .iter()
        .any(|r| r.spec().contains(MARKER_COMMENT))
}

/// Run the watcher until the queued events are consumed.
async fn drain(watcher: &Watcher<FakePlatform>, platform: &FakePlatform) {
    platform.close_events();
    let result = watcher.run(std::future::pending()).await;
    assert!(matches!(result, Err(Error::EventStreamClosed)));
}

#[tokio::test]
async fn test_backfill_then_live_events() {
    let platform = Arc::new(FakePlatform::new(topology()));
    let running = attached("web.1");
    let started = attached("web.2");
    platform.add_running(ContainerStart::new("aaa", Some("web")), running.clone());
    platform.add_container("bbb", started.clone());
    platform.emit(ContainerStart::new("bbb", Some("web")));

    drain(&watcher(&platform, ServiceFilter::default(), true), &platform).await;

    assert!(configured(&running));
    assert!(configured(&started));
    assert_eq!(platform.shutdowns(), 1);
}

#[tokio::test]
async fn test_without_backfill_running_containers_are_left_alone() {
    let platform = Arc::new(FakePlatform::new(topology()));
    let running = attached("web.1");
    platform.add_running(ContainerStart::new("aaa", Some("web")), running.clone());

    drain(&watcher(&platform, ServiceFilter::default(), false), &platform).await;

    assert_eq!(running.calls(), 0);
}

#[tokio::test]
async fn test_backfill_respects_service_filter() {
    let platform = Arc::new(FakePlatform::new(topology()));
    let web = attached("web.1");
    let db = attached("db.1");
    platform.add_running(ContainerStart::new("aaa", Some("web")), web.clone());
    platform.add_running(ContainerStart::new("bbb", Some("db")), db.clone());

    drain(&watcher(&platform, ServiceFilter::new(["web"]), true), &platform).await;

    assert!(configured(&web));
    assert_eq!(db.calls(), 0);
}

#[tokio::test]
async fn test_failing_container_does_not_block_others() {
    let platform = Arc::new(FakePlatform::new(topology()));
    let broken = attached("web.1");
    let healthy = attached("web.2");
    broken.fail("add_firewall_rule", usize::MAX);
    platform.add_container("aaa", broken.clone());
    platform.add_container("bbb", healthy.clone());
    platform.emit(ContainerStart::new("aaa", None));
    platform.emit(ContainerStart::new("gone", None));
    platform.emit(ContainerStart::new("bbb", None));

    drain(&watcher(&platform, ServiceFilter::default(), false), &platform).await;

    assert!(!configured(&broken));
    assert!(configured(&healthy));
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let platform = Arc::new(FakePlatform::new(topology()));
    let ns = attached("web.1");
    ns.fail("interface_addrs", 2);
    platform.add_container("aaa", ns.clone());
    platform.emit(ContainerStart::new("aaa", None));

    drain(&watcher(&platform, ServiceFilter::default(), false), &platform).await;

    assert!(configured(&ns));
}

#[tokio::test]
async fn test_repeated_start_events_converge() {
    let platform = Arc::new(FakePlatform::new(topology()));
    let ns = attached("web.1");
    platform.add_running(ContainerStart::new("aaa", None), ns.clone());
    platform.emit(ContainerStart::new("aaa", None));
    platform.emit(ContainerStart::new("aaa", None));

    drain(&watcher(&platform, ServiceFilter::default(), true), &platform).await;

    assert_eq!(ns.routing_rules().len(), 1);
    assert_eq!(
        ns.firewall_rules()
            .iter()
            .filter(|r| r.spec().contains(MARKER_COMMENT))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_stream_errors_are_skipped() {
    let platform = Arc::new(FakePlatform::new(topology()));
    let ns = attached("web.1");
    platform.add_container("aaa", ns.clone());
    platform.emit_error(Error::EventStreamClosed);
    platform.emit(ContainerStart::new("aaa", None));

    drain(&watcher(&platform, ServiceFilter::default(), false), &platform).await;

    assert!(configured(&ns));
}

#[tokio::test]
async fn test_shutdown_stops_watcher_and_children() {
    let platform = Arc::new(FakePlatform::new(topology()));
    let ns = attached("web.1");
    platform.add_container("aaa", ns.clone());
    platform.emit(ContainerStart::new("aaa", None));

    let result = watcher(&platform, ServiceFilter::default(), false)
        .run(async {})
        .await;

    assert!(result.is_ok());
    assert_eq!(platform.shutdowns(), 1);
    assert!(!configured(&ns), "no events are handled after shutdown");
}

#[tokio::test]
async fn test_shutdown_terminates_hung_install() {
    let platform = Arc::new(FakePlatform::new(topology()));
    platform.hang_until_shutdown();
    let ns = attached("web.1");
    platform.add_container("aaa", ns.clone());
    platform.emit(ContainerStart::new("aaa", None));

    let watcher = watcher(&platform, ServiceFilter::default(), false);
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        watcher.run(tokio::time::sleep(Duration::from_millis(100))),
    )
    .await
    .expect("shutdown must not wait for a hung install");

    assert!(result.is_ok());
    assert!(platform.shutdowns() >= 1);
    assert_eq!(ns.calls(), 0);
    assert!(!configured(&ns));
}
