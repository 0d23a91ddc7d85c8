mod common;

mod lifecycle;
mod transport;

use crate::common::{endpoint, sim_bridge, Client};
use cebridge::protocol::METHOD_NOT_FOUND;
use serde_json::json;

#[test]
fn test_ping() {
    let (bridge, _) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));

    let response = client.request("ping", json!({}));
    assert_eq!(response.id, json!(1));
    let result = response.as_result().unwrap();
    assert_eq!(result["success"], json!(true));
    assert!(result["version"].is_string());
    assert!(result["timestamp"].is_i64());
}

#[test]
fn test_breakpoint_slots_exhausted() {
    let (bridge, sim) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));

    for (i, address) in ["0x401000", "0x401005", "0x401009", "0x40100F"]
        .into_iter()
        .enumerate()
    {
        let result = client.call("set_breakpoint", json!({ "address": address }));
        assert_eq!(result["success"], json!(true));
        assert_eq!(result["slot"], json!(i + 1));
    }

    let result = client.call("set_breakpoint", json!({"address": "0x401011"}));
    assert_eq!(
        result,
        json!({"success": false, "error": "no free hardware slot"})
    );
    assert_eq!(sim.live_breakpoints(), 4);

    // a trap from the host lands in the history of its breakpoint
    assert_eq!(sim.fire(0x401000, 0x401000), Some(true));
    let hits = client.call("get_breakpoint_hits", json!({"id": "bp_0x401000"}));
    assert_eq!(hits["count"], json!(1));
}

#[test]
fn test_watch_start_stop() {
    let (bridge, sim) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));

    let started = client.call("start_dbvm_watch", json!({"address": "0x500000", "mode": "w"}));
    assert_eq!(started["success"], json!(true));
    assert_eq!(started["status"], json!("monitoring"));

    sim.touch(0x500000, 0x401011);

    let stopped = client.call("stop_dbvm_watch", json!({"address": "0x500000"}));
    assert_eq!(stopped["success"], json!(true));
    assert_eq!(stopped["hits"].as_array().unwrap().len(), 1);

    let polled = client.call("poll_dbvm_watch", json!({"address": "0x500000"}));
    assert_eq!(
        polled,
        json!({"success": false, "error": "no active watch"})
    );
    assert_eq!(sim.live_watches(), 0);
}

#[test]
fn test_unknown_method() {
    let (bridge, _) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));

    client.call("ping", json!({}));
    let response = client.request("evaluate_lua", json!({"code": "return 1"}));
    assert_eq!(response.id, json!(2));
    assert_eq!(response.as_error().unwrap().code, METHOD_NOT_FOUND);

    // the connection stays usable
    let result = client.call("get_process_info", json!({}));
    assert_eq!(result["process_id"], json!(4242));
}

#[test]
fn test_scan_session_over_the_wire() {
    let (bridge, sim) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));

    let scan = client.call("scan_all", json!({"value": 100, "type": "dword"}));
    assert_eq!(scan["count"], json!(1));

    let results = client.call("get_scan_results", json!({"max": 5}));
    assert_eq!(results["returned"], json!(1));
    assert_eq!(results["results"][0]["address"], json!("0x500040"));

    let aob = client.call("aob_scan", json!({"pattern": "4D 5A", "limit": 5}));
    assert_eq!(aob["addresses"], json!(["0x400000"]));

    // only the value scan session keeps a result set alive
    assert_eq!(sim.live_scans(), 1);
}
