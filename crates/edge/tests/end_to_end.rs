//! Full path: client -> edge -> gateway -> queue -> worker -> gateway -> edge.

use askq_core::config::EdgeSettings;
use askq_core::{BackoffPolicy, SessionId};
use askq_dispatch::{
    shutdown, DispatchGateway, GatewayConfig, GatewayServer, WorkerConfig, WorkerPool,
};
use askq_edge::{EdgeClient, EdgeServer, GatewayApi, HttpGatewayClient};
use askq_llm::{EchoClient, LlmAnswerer};
use askq_queue::{SqliteQueue, SqliteQueueConfig};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Fabric {
    gateway_url: String,
    edge_url: String,
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Fabric {
    async fn start() -> Self {
        let tx = shutdown::channel();
        let queue = Arc::new(
            SqliteQueue::open_in_memory(SqliteQueueConfig {
                poll_interval: Duration::from_millis(10),
                ..SqliteQueueConfig::default()
            })
            .unwrap(),
        );

        let gateway = DispatchGateway::new(
            queue.clone(),
            GatewayConfig {
                stream_poll_interval: Duration::from_millis(50),
                receive_wait: Duration::from_millis(50),
                ..GatewayConfig::default()
            },
        );
        let mut handles = gateway.start_background(&tx).unwrap();

        let answerer = Arc::new(LlmAnswerer::new(Arc::new(EchoClient::new()), "echo"));
        handles.extend(WorkerPool::spawn(
            2,
            queue.clone(),
            answerer,
            WorkerConfig {
                receive_wait: Duration::from_millis(50),
                ..WorkerConfig::default()
            },
            &tx,
        ));

        let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_url = format!("http://{}", gateway_listener.local_addr().unwrap());
        let gateway_server = GatewayServer::new(gateway, Duration::from_secs(1), tx.clone());
        handles.push(tokio::spawn(async move {
            gateway_server.serve(gateway_listener).await.unwrap();
        }));

        let remote: Arc<dyn GatewayApi> =
            Arc::new(HttpGatewayClient::new(&gateway_url).unwrap());
        let settings = EdgeSettings {
            default_poll_wait_ms: 0,
            reconnect: BackoffPolicy {
                initial_ms: 10,
                max_ms: 100,
                max_attempts: u32::MAX,
            },
            ..EdgeSettings::default()
        };
        let edge = EdgeServer::new(settings, remote, tx.clone()).unwrap();
        handles.push(edge.start_pump());

        let edge_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let edge_url = format!("http://{}", edge_listener.local_addr().unwrap());
        handles.push(tokio::spawn(async move {
            edge.serve(edge_listener).await.unwrap();
        }));

        Self {
            gateway_url,
            edge_url,
            shutdown: tx,
            handles,
        }
    }

    fn client(&self, session: &str) -> EdgeClient {
        EdgeClient::new(&self.edge_url, SessionId::parse(session).unwrap()).unwrap()
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        for handle in self.handles {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("task did not stop")
                .unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_question_is_answered_end_to_end() {
    let fabric = Fabric::start().await;
    let client = fabric.client("student");

    let query_id = client.submit("What is heredity?").await.unwrap();
    assert_eq!(query_id.to_string().len(), 36);

    let answer = client
        .wait_for_answer("What is heredity?", 50, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(answer, "Echo: What is heredity?");

    fabric.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callers_only_see_their_own_answers() {
    let fabric = Fabric::start().await;
    let alice = fabric.client("alice");
    let bob = fabric.client("bob");

    alice.submit("alice question").await.unwrap();
    bob.submit("bob question").await.unwrap();

    let alice_answer = alice
        .wait_for_answer("alice question", 50, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(alice_answer, "Echo: alice question");
    bob.wait_for_answer("bob question", 50, Duration::from_millis(100))
        .await
        .unwrap();

    let alice_view = alice.poll(None).await.unwrap();
    assert!(!alice_view.contains_key("bob question"));
    let bob_view = bob.poll(None).await.unwrap();
    assert!(!bob_view.contains_key("alice question"));

    fabric.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_poll_without_answers_is_empty() {
    let fabric = Fabric::start().await;
    let client = fabric.client("nobody");

    assert!(client.poll(None).await.unwrap().is_empty());

    fabric.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_question_is_rejected() {
    let fabric = Fabric::start().await;
    let client = fabric.client("student");

    let err = client.submit("   ").await.unwrap_err();
    assert!(matches!(err, askq_core::AppError::InvalidInput(_)));

    fabric.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_with_reserved_characters_streams_results() {
    let fabric = Fabric::start().await;
    let gateway = HttpGatewayClient::new(&fabric.gateway_url).unwrap();
    let session = SessionId::parse("team?a #1%").unwrap();

    let mut stream = gateway.open_stream(&session).await.unwrap();
    let query_id = gateway.submit("What is heredity?", &session).await.unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("no result within 10s")
        .expect("stream ended")
        .unwrap();
    assert_eq!(envelope.query_id, query_id);
    assert_eq!(envelope.result, "Echo: What is heredity?");

    drop(stream);
    fabric.stop().await;
}
