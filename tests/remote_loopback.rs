use std::net::TcpStream;

use serde_json::{Value, json};

use teleop_sync::config::RemoteConfig;
use teleop_sync::error::RemoteError;
use teleop_sync::remote::client::PolicyClient;
use teleop_sync::remote::codec::{Tensor, recv_json, send_json};
use teleop_sync::remote::protocol::{Policy, PolicyError, Response};
use teleop_sync::remote::server::{PolicyServer, ServerHandle};

#[derive(Debug, thiserror::Error)]
#[error("action head failed")]
struct HeadError(#[source] std::io::Error);

/// Doubles the `state` tensor; fails when asked to act without an instruction.
#[derive(Default)]
struct Doubler {
    instruction: Option<String>,
    observations: usize,
}

impl Policy for Doubler {
    fn reset(&mut self) -> Result<Value, PolicyError> {
        self.instruction = None;
        self.observations = 0;
        Ok(json!("reset"))
    }

    fn set_language(&mut self, instruction: &str) -> Result<Value, PolicyError> {
        self.instruction = Some(instruction.to_string());
        Ok(Value::Null)
    }

    fn update_obs(&mut self, _obs: Value) -> Result<Value, PolicyError> {
        self.observations += 1;
        Ok(json!(self.observations))
    }

    fn get_action(&mut self, obs: Value) -> Result<Value, PolicyError> {
        if self.instruction.is_none() {
            return Err(Box::new(HeadError(std::io::Error::other("no instruction set"))));
        }
        let state = Tensor::from_value(&obs["state"]).ok_or("state is not a tensor")??;
        let doubled: Vec<f64> = state.to_f64().iter().map(|v| v * 2.0).collect();
        Ok(Tensor::from_f64(state.shape().to_vec(), &doubled)?.to_value())
    }
}

fn serve() -> ServerHandle {
    PolicyServer::bind("127.0.0.1:0", Doubler::default())
        .unwrap()
        .spawn()
        .unwrap()
}

fn client(server: &ServerHandle) -> PolicyClient {
    PolicyClient::connect(&RemoteConfig {
        addr: server.addr().to_string(),
        timeout_ms: 5_000,
        connect_attempts: 3,
        retry_delay_ms: 10,
    })
    .unwrap()
}

#[test]
fn full_command_cycle_over_loopback() {
    let server = serve();
    let mut client = client(&server);

    assert_eq!(client.reset().unwrap(), json!("reset"));
    client.set_language("stack the cups").unwrap();
    assert_eq!(client.update_obs(json!({"frame": 1})).unwrap(), json!(1));

    let state = Tensor::from_f64(vec![2, 2], &[0.5, -1.0, 2.0, 0.0]).unwrap();
    let action = client.get_action(json!({ "state": state.to_value() })).unwrap();
    let action = Tensor::from_value(&action).unwrap().unwrap();
    assert_eq!(action.shape(), &[2, 2]);
    assert_eq!(action.to_f64(), vec![1.0, -2.0, 4.0, 0.0]);
}

#[test]
fn policy_failure_comes_back_as_a_server_error_with_its_cause_chain() {
    let server = serve();
    let mut client = client(&server);
    client.reset().unwrap();

    let state = Tensor::from_f64(vec![1], &[1.0]).unwrap();
    match client.get_action(json!({ "state": state })) {
        Err(RemoteError::Server { message, traceback }) => {
            assert_eq!(message, "action head failed");
            assert!(traceback.contains("caused by: no instruction set"), "{traceback}");
        }
        other => panic!("expected a server error, got {other:?}"),
    }
}

#[test]
fn unknown_command_is_answered_then_the_connection_closes() {
    let server = serve();
    let mut stream = TcpStream::connect(server.addr()).unwrap();

    send_json(&mut stream, &json!({"cmd": "train", "obs": null})).unwrap();
    let reply: Response = recv_json(&mut stream).unwrap();
    match reply {
        Response::Error { error, .. } => assert!(error.contains("train")),
        other => panic!("expected an error reply, got {other:?}"),
    }
    assert!(matches!(recv_json::<_, Response>(&mut stream), Err(RemoteError::Closed)));
}

#[test]
fn connect_gives_up_after_the_configured_attempts() {
    // bind then drop to get a port nothing listens on
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let result = PolicyClient::connect(&RemoteConfig {
        addr: addr.to_string(),
        timeout_ms: 100,
        connect_attempts: 2,
        retry_delay_ms: 1,
    });
    assert!(matches!(result, Err(RemoteError::Connect { attempts: 2, .. })));
}
