use crate::common::{endpoint, sim_bridge, Client};
use cebridge::protocol::{self, Request, INVALID_REQUEST, PARSE_ERROR};
use serde_json::{json, Map, Value};

#[test]
fn test_invalid_length_drops_connection() {
    let (bridge, _) = sim_bridge();
    let endpoint = endpoint(&bridge);

    struct TestCase {
        header: [u8; 4],
    }
    let cases = [
        TestCase {
            header: 0u32.to_le_bytes(),
        },
        TestCase {
            header: u32::MAX.to_le_bytes(),
        },
    ];

    for tc in cases {
        let mut client = Client::connect(&endpoint);
        client.send_bytes(&tc.header);
        assert!(client.is_dropped());

        // the bridge is back in the accept state and serves the next client
        let mut next = Client::connect(&endpoint);
        assert_eq!(next.call("ping", json!({}))["success"], json!(true));
    }
}

#[test]
fn test_pipelined_requests_answered_in_order() {
    let (bridge, _) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));

    let methods = ["ping", "get_process_info", "enum_modules", "get_thread_list", "list_breakpoints"];
    for (id, method) in methods.iter().enumerate() {
        let request = Request::new(*method, Map::new(), id as u64);
        client.send_raw(&protocol::encode(&request).unwrap());
    }

    for id in 0..methods.len() {
        let response = client.read_response();
        assert_eq!(response.id, json!(id));
        assert_eq!(response.as_result().unwrap()["success"], json!(true));
    }
}

#[test]
fn test_protocol_errors_keep_connection() {
    let (bridge, _) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));

    client.send_raw(b"{\"method\": ");
    let response = client.read_response();
    assert_eq!(response.id, Value::Null);
    assert_eq!(response.as_error().unwrap().code, PARSE_ERROR);

    client.send_raw(b"[1, 2, 3]");
    let response = client.read_response();
    assert_eq!(response.as_error().unwrap().code, INVALID_REQUEST);

    client.send_raw(&[0xff, 0xfe, 0x00]);
    let response = client.read_response();
    assert_eq!(response.as_error().unwrap().code, PARSE_ERROR);

    assert_eq!(client.call("ping", json!({}))["success"], json!(true));
}

#[test]
fn test_jsonrpc_envelope_and_null_id() {
    let (bridge, _) = sim_bridge();
    let mut client = Client::connect(&endpoint(&bridge));

    client.send_raw(br#"{"jsonrpc": "2.0", "method": "ping", "params": null, "id": null}"#);
    let response = client.read_response();
    assert_eq!(response.jsonrpc.as_deref(), Some("2.0"));
    assert_eq!(response.id, Value::Null);
    assert_eq!(response.as_result().unwrap()["success"], json!(true));

    client.send_raw(br#"{"method": "read_memory", "params": {"address": "main", "size": 2}, "id": "r-1"}"#);
    let response = client.read_response();
    assert_eq!(response.id, json!("r-1"));
    assert_eq!(response.as_result().unwrap()["bytes"], json!([0x48, 0x89]));
}
