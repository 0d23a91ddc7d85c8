use crate::common::{endpoint, sim_bridge, Client};
use cebridge::bridge::Bridge;
use cebridge::config::BridgeConfig;
use cebridge::host::sim::SimulatedProvider;
use cebridge::transport::Endpoint;
use serde_json::json;

#[test]
fn test_restart_releases_zombie_resources() {
    let (mut bridge, sim) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));

    client.call("set_breakpoint", json!({"address": "main"}));
    client.call("set_data_breakpoint", json!({"address": "player_health", "access_type": "w"}));
    client.call("start_dbvm_watch", json!({"address": "player_health"}));
    client.call("scan_all", json!({"value": 100}));
    let first_session = client.call("ping", json!({}))["session"].clone();

    assert_eq!(sim.live_breakpoints(), 2);
    assert_eq!(sim.live_watches(), 1);
    assert_eq!(sim.live_scans(), 1);

    bridge.start().unwrap();

    assert_eq!(sim.live_breakpoints(), 0);
    assert_eq!(sim.live_watches(), 0);
    assert_eq!(sim.live_scans(), 0);

    // the previous client was dropped with the old transport
    assert!(client.is_dropped());

    let mut client = Client::connect(&endpoint(&bridge));
    assert_eq!(client.call("list_breakpoints", json!({}))["count"], json!(0));
    assert_eq!(
        client.call("get_scan_results", json!({}))["error"],
        json!("no active scan")
    );
    let started = client.call("start_dbvm_watch", json!({"address": "player_health"}));
    assert_eq!(started["success"], json!(true));
    assert_ne!(client.call("ping", json!({}))["session"], first_session);
}

#[test]
fn test_stop_unblocks_connected_client() {
    let (mut bridge, sim) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));
    client.call("set_breakpoint", json!({"address": "main"}));

    bridge.stop();
    assert!(!bridge.is_running());
    assert!(client.is_dropped());
    assert_eq!(sim.live_breakpoints(), 0);

    // stopping again and dropping are no-ops
    bridge.stop();
    drop(bridge);
}

#[test]
fn test_drop_releases_resources() {
    let (bridge, sim) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));
    client.call("start_dbvm_watch", json!({"address": "0x500100"}));
    assert_eq!(sim.live_watches(), 1);

    drop(bridge);
    assert_eq!(sim.live_watches(), 0);
    assert!(client.is_dropped());
}

#[test]
fn test_unix_socket_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cebridge.sock");
    let sim = SimulatedProvider::default_target();
    let config = BridgeConfig {
        listen: format!("unix:{}", path.display()),
        hardware_slots: 2,
        ..BridgeConfig::default()
    };

    let mut bridge = Bridge::new(Box::new(sim.clone()), config);
    bridge.start().unwrap();
    assert_eq!(bridge.local_endpoint(), Some(&Endpoint::Unix(path.clone())));

    {
        let mut client = Client::connect(&Endpoint::Unix(path.clone()));
        client.call("set_breakpoint", json!({"address": "0x401000"}));
        client.call("set_breakpoint", json!({"address": "0x401005"}));
        let full = client.call("set_breakpoint", json!({"address": "0x401009"}));
        assert_eq!(full["error"], json!("no free hardware slot"));
    }

    bridge.stop();
    assert!(!path.exists());
    assert_eq!(sim.live_breakpoints(), 0);
}
