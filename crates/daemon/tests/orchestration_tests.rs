//! Orchestration integration tests
//!
//! Detector and manager wired together the way the daemon runs them, with
//! a scripted device list and in-memory USB devices.
//!
//! Run with: `cargo test -p daemon --test orchestration_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockConnector, MockLister, create_mock_device_info,
    create_mock_device_list, free_tcp_port, with_timeout,
};
use daemon::bridge::{BridgeContext, BridgeState};
use daemon::config::BridgeSettings;
use daemon::orchestration::{BridgeManager, DeviceDetector, DeviceListener};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

fn test_context() -> BridgeContext {
    let settings = BridgeSettings {
        reconnect_backoff_ms: 200,
        usb_read_poll_ms: 20,
        pump_stop_timeout_ms: 1000,
        close_timeout_ms: 3000,
        ..Default::default()
    };
    BridgeContext::new(settings, IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Manager whose bridges never get past connecting, so no ports are bound
fn offline_manager(base_port: u16) -> (Arc<BridgeManager>, Arc<MockConnector>) {
    let (connector, _devices) = MockConnector::new();
    connector.fail_next(usize::MAX);
    let manager = Arc::new(BridgeManager::new(
        base_port,
        connector.clone(),
        test_context(),
    ));
    (manager, connector)
}

// ============================================================================
// Bridge manager
// ============================================================================

mod manager {
    use super::*;

    #[tokio::test]
    async fn test_consecutive_ports_in_first_seen_order() {
        let (manager, _connector) = offline_manager(20000);
        manager.initial_list(&create_mock_device_list(2));
        manager.device_added(&create_mock_device_info(7));

        let list = manager.bridge_list();
        let summary: Vec<(&str, u16)> = list.iter().map(|s| (s.serial.as_str(), s.port)).collect();
        assert_eq!(
            summary,
            vec![("SN000001", 20000), ("SN000002", 20001), ("SN000007", 20002)]
        );
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_known_serial_keeps_its_port() {
        let (manager, _connector) = offline_manager(20000);
        manager.device_added(&create_mock_device_info(1));
        manager.device_added(&create_mock_device_info(2));

        manager.device_removed(&create_mock_device_info(1));
        manager.device_added(&create_mock_device_info(1));

        let list = manager.bridge_list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].serial, "SN000001");
        assert_eq!(list[0].port, 20000);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bridge_list_json() {
        let (manager, _connector) = offline_manager(20000);
        manager.device_added(&create_mock_device_info(1));

        let json = serde_json::to_value(manager.bridge_list()).unwrap();
        let entry = &json[0];
        assert_eq!(entry["serial"], "SN000001");
        assert_eq!(entry["port"], 20000);
        assert!(entry["state"].is_string());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (manager, _connector) = offline_manager(20000);
        manager.initial_list(&create_mock_device_list(3));

        manager.close().await.unwrap();
        manager.close().await.unwrap();
        for status in manager.bridge_list() {
            assert_eq!(status.state, "disconnected");
        }
    }

    #[tokio::test]
    async fn test_managed_bridge_goes_online() {
        let (connector, mut devices) = MockConnector::new();
        let port = free_tcp_port();
        let manager = BridgeManager::new(port, connector, test_context());
        manager.device_added(&create_mock_device_info(1));

        let bridge = manager.bridge("SN000001").expect("bridge created");
        let mut states = bridge.subscribe_state();
        let online = with_timeout(
            DEFAULT_TEST_TIMEOUT,
            states.wait_for(|s| *s == BridgeState::Online),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(online);
        let device = devices.recv().await.unwrap();

        manager.close().await.unwrap();
        assert!(device.wait_released(DEFAULT_TEST_TIMEOUT).await);
        assert_eq!(manager.bridge_list()[0].state, "disconnected");
    }
}

// ============================================================================
// Device detector
// ============================================================================

mod detector {
    use super::*;

    #[tokio::test]
    async fn test_initial_scan_feeds_manager() {
        let lister = MockLister::new(create_mock_device_list(2));
        let detector = DeviceDetector::new(lister, Duration::from_secs(5));
        detector.detect().await.unwrap();

        let (manager, _connector) = offline_manager(20000);
        let known = detector.add_listener(manager.clone());
        assert_eq!(known.len(), 2);
        assert_eq!(manager.bridge_list().len(), 2);

        detector.close().await;
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_picks_up_new_device() {
        let lister = MockLister::new(Vec::new());
        let detector = DeviceDetector::new(lister.clone(), Duration::from_millis(50));
        let (manager, _connector) = offline_manager(20000);
        detector.add_listener(manager.clone());
        detector.start_listening();

        lister.set_devices(vec![create_mock_device_info(4)]);
        let found = with_timeout(DEFAULT_TEST_TIMEOUT, async {
            while manager.bridge_list().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(found.is_ok());
        assert_eq!(manager.bridge_list()[0].serial, "SN000004");

        detector.close().await;
        let calls = lister.calls();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(lister.calls(), calls);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_listing_errors_do_not_stop_polling() {
        let lister = MockLister::new(Vec::new());
        lister.set_fail(true);
        let detector = DeviceDetector::new(lister.clone(), Duration::from_millis(30));
        detector.start_listening();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(lister.calls() >= 2);

        lister.set_fail(false);
        lister.set_devices(create_mock_device_list(1));
        let found = with_timeout(DEFAULT_TEST_TIMEOUT, async {
            while detector.devices().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(found.is_ok());

        detector.close().await;
        detector.close().await;
    }
}
