//! Runner end to end against the in-memory broker and auth backend.

use std::sync::Arc;
use std::time::Duration;

use authrpc_core::{parse_config, OperationId};
use authrpc_server::broker::{BrokerEvent, InMemoryBroker, OutboundReply};
use authrpc_server::{Broker, MemoryWorkflowFactory, Runner};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::Dispatch;

const CONFIG: &str = r#"{
    "jwt_validation": [
        {"name": "authrpc", "methods": ["HS256", "HS512"], "secret": {"type": "plain", "value": "integration-key"}}
    ],
    "jwt_creation": {
        "issuer": "authrpc",
        "signmethod": "HS512",
        "secret": {"type": "plain", "value": "integration-key"}
    },
    "amqp_settings": {"username": "guest", "password": "guest", "hostname": "localhost"},
    "app_config": {"admin_user": "root", "admin_password": "toor", "registration_open": true},
    "queue_settings": {"user_workflow_get_all": "users.list"},
    "log_settings": {"level": "DEBUG", "handler": "stderr"},
    "some_future_section": {"ignored": true}
}"#;

struct Harness {
    broker: Arc<InMemoryBroker>,
    stop: oneshot::Sender<()>,
    running: tokio::task::JoinHandle<Result<(), authrpc_server::RunnerError>>,
    next_id: u32,
}

impl Harness {
    async fn start() -> Self {
        let config = parse_config(CONFIG).unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let runner = Runner::new(
            config,
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(MemoryWorkflowFactory::new()),
            Dispatch::none(),
        )
        .with_drain_timeout(Duration::from_secs(5));

        let (stop, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(runner.run(async {
            let _ = stop_rx.await;
        }));

        while consuming_count(&broker) < OperationId::ALL.len() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Self {
            broker,
            stop,
            running,
            next_id: 0,
        }
    }

    async fn call(&mut self, queue: &str, args: Value) -> OutboundReply {
        self.next_id += 1;
        let correlation_id = format!("call-{}", self.next_id);
        self.broker
            .publish_call(queue, &args, &correlation_id)
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            self.broker.wait_for_reply(&correlation_id),
        )
        .await
        .unwrap()
    }

    async fn stop(self) -> Arc<InMemoryBroker> {
        self.stop.send(()).unwrap();
        self.running.await.unwrap().unwrap();
        self.broker
    }
}

fn consuming_count(broker: &InMemoryBroker) -> usize {
    broker
        .events()
        .iter()
        .filter(|event| matches!(event, BrokerEvent::Consuming(_)))
        .count()
}

#[tokio::test]
async fn login_flow_and_failure_translation() {
    let mut harness = Harness::start().await;

    let reply = harness
        .call("login", json!({"username": "root", "password": "toor"}))
        .await;
    assert!(!reply.is_error);
    assert_eq!(reply.body["response_code"], 200);
    let access_token = reply.body["response_data"]["access_token"]
        .as_str()
        .unwrap()
        .to_owned();
    let refresh_token = reply.body["response_data"]["refresh_token"]
        .as_str()
        .unwrap()
        .to_owned();

    let reply = harness
        .call("login", json!({"username": "root", "password": "wrong"}))
        .await;
    assert_eq!(
        reply.body,
        json!({"response_code": 401, "response_data": {"message": "could not login"}})
    );

    let reply = harness.call("login", json!({"username": "root"})).await;
    assert_eq!(
        reply.body,
        json!({"response_code": 400, "response_data": {"message": "invalid data"}})
    );

    let reply = harness
        .call("token", json!({"refresh_token": "not-issued"}))
        .await;
    assert_eq!(reply.body["response_code"], 401);

    let reply = harness
        .call("token", json!({"refresh_token": refresh_token}))
        .await;
    assert_eq!(reply.body["response_code"], 200);

    let reply = harness
        .call(
            "user_admin_create",
            json!({"token": access_token, "username": "alice", "password": "pw", "groups": ["admin"]}),
        )
        .await;
    assert_eq!(reply.body["response_code"], 201);

    let reply = harness
        .call("users.list", json!({"token": access_token}))
        .await;
    assert_eq!(reply.body["response_code"], 200);
    assert_eq!(
        reply.body["response_data"]["users"]
            .as_array()
            .unwrap()
            .len(),
        2
    );

    let reply = harness
        .call("logout", json!({"refresh_token": refresh_token}))
        .await;
    assert_eq!(reply.body["response_code"], 200);

    let broker = harness.stop().await;
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(broker.close_count(), 1);
    assert_eq!(broker.events().last(), Some(&BrokerEvent::Closed));
}

#[tokio::test]
async fn default_queue_is_replaced_by_override() {
    let harness = Harness::start().await;
    let declared = harness.broker.declared_queues();
    assert!(declared.contains(&"users.list".to_owned()));
    assert!(!declared.contains(&"user_get_all".to_owned()));
    assert_eq!(declared.len(), OperationId::ALL.len());
    harness.stop().await;
}

#[tokio::test]
async fn invalid_payload_on_default_chain_is_400() {
    let mut harness = Harness::start().await;

    harness
        .broker
        .publish_raw("group_create", b"\xff\xfe".to_vec(), Some("raw-1"))
        .unwrap();
    let reply = harness.broker.wait_for_reply("raw-1").await;
    assert_eq!(reply.body["response_code"], 400);

    let reply = harness
        .call("group_create", json!({"token": "garbage", "group": "ops"}))
        .await;
    assert_eq!(
        reply.body,
        json!({"response_code": 401, "response_data": {"message": "invalid token"}})
    );

    harness.stop().await;
}
