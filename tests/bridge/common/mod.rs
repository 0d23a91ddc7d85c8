use cebridge::bridge::Bridge;
use cebridge::config::BridgeConfig;
use cebridge::host::sim::SimulatedProvider;
use cebridge::protocol::{self, Request, Response};
use cebridge::transport::{read_frame, write_frame, Connection, Endpoint, DEFAULT_MAX_FRAME_SIZE};
use serde_json::{Map, Value};
use std::io::Write;
use std::thread;
use std::time::Duration;

const CONNECT_ATTEMPTS: usize = 50;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Framed JSON client of a bridge.
pub struct Client {
    conn: Connection,
    next_id: u64,
}

impl Client {
    /// Connect to a bridge, retrying while the listener is not ready yet.
    pub fn connect(endpoint: &Endpoint) -> Client {
        for _ in 0..CONNECT_ATTEMPTS {
            if let Ok(conn) = Connection::connect(endpoint) {
                conn.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
                return Client { conn, next_id: 0 };
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("bridge at {endpoint} is not reachable");
    }

    pub fn request(&mut self, method: &str, params: Value) -> Response {
        self.next_id += 1;
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let request = Request::new(method, params, self.next_id);
        self.send_raw(&protocol::encode(&request).unwrap());
        let response = self.read_response();
        assert_eq!(response.id, Value::from(self.next_id));
        response
    }

    /// Call a method and return its result, protocol errors fail the test.
    pub fn call(&mut self, method: &str, params: Value) -> Value {
        let response = self.request(method, params);
        match response.as_result() {
            Some(result) => result.clone(),
            None => panic!("{method}: unexpected protocol error {:?}", response.as_error()),
        }
    }

    pub fn send_raw(&mut self, payload: &[u8]) {
        write_frame(&mut self.conn, payload).unwrap();
    }

    /// Write bytes as is, without framing.
    pub fn send_bytes(&mut self, bytes: &[u8]) {
        self.conn.write_all(bytes).unwrap();
        self.conn.flush().unwrap();
    }

    pub fn read_response(&mut self) -> Response {
        let payload = read_frame(&mut self.conn, DEFAULT_MAX_FRAME_SIZE).unwrap();
        protocol::decode_response(&payload).unwrap()
    }

    /// `true` if the bridge has closed this connection.
    pub fn is_dropped(&mut self) -> bool {
        read_frame(&mut self.conn, DEFAULT_MAX_FRAME_SIZE).is_err()
    }
}

/// Bridge over the default simulated target, listening on an ephemeral local port.
pub fn sim_bridge() -> (Bridge, SimulatedProvider) {
    let sim = SimulatedProvider::default_target();
    let config = BridgeConfig {
        listen: "127.0.0.1:0".to_string(),
        ..BridgeConfig::default()
    };
    let mut bridge = Bridge::new(Box::new(sim.clone()), config);
    bridge.start().unwrap();
    (bridge, sim)
}

pub fn endpoint(bridge: &Bridge) -> Endpoint {
    bridge.local_endpoint().cloned().expect("bridge is running")
}
