//! End-to-end tests of gateway, fan-in and workers over one queue.

use crate::gateway::{DispatchGateway, GatewayConfig};
use crate::protocol::{self, ResponseMessage};
use crate::shutdown;
use crate::worker::{WorkerConfig, WorkerPool};
use askq_core::{AppError, AppResult, BackoffPolicy, QueryId, SessionId};
use askq_llm::Answerer;
use askq_queue::{DeadLetter, Delivery, DurableQueue, QueueStats, SqliteQueue, SqliteQueueConfig};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod tests {
    use super::*;

    struct PrefixAnswerer;

    #[async_trait::async_trait]
    impl Answerer for PrefixAnswerer {
        async fn answer(&self, question: &str) -> AppResult<String> {
            Ok(format!("answer: {}", question))
        }
    }

    fn fast_retry() -> BackoffPolicy {
        BackoffPolicy {
            initial_ms: 1,
            max_ms: 5,
            max_attempts: 3,
        }
    }

    fn gateway_config() -> GatewayConfig {
        GatewayConfig {
            stream_poll_interval: Duration::from_millis(50),
            receive_wait: Duration::from_millis(50),
            publish_retry: fast_retry(),
            ..GatewayConfig::default()
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            receive_wait: Duration::from_millis(50),
            retry_delay: Duration::from_millis(10),
            publish_retry: fast_retry(),
            ..WorkerConfig::default()
        }
    }

    fn memory_queue(visibility: Duration) -> Arc<SqliteQueue> {
        Arc::new(
            SqliteQueue::open_in_memory(SqliteQueueConfig {
                visibility_timeout: visibility,
                poll_interval: Duration::from_millis(10),
                ..SqliteQueueConfig::default()
            })
            .unwrap(),
        )
    }

    fn session(name: &str) -> SessionId {
        SessionId::parse(name).unwrap()
    }

    async fn publish_response(queue: &SqliteQueue, query_id: QueryId, text: &str) {
        let message = ResponseMessage {
            query_id,
            result: text.to_string(),
            produced_at: None,
        };
        queue
            .publish("query_responses", &protocol::encode(&message).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_thousand_queries_from_ten_callers() {
        let queue = memory_queue(Duration::from_secs(30));
        let gateway = DispatchGateway::new(queue.clone(), gateway_config());
        let tx = shutdown::channel();
        let mut handles = gateway.start_background(&tx).unwrap();
        handles.extend(WorkerPool::spawn(
            8,
            queue.clone(),
            Arc::new(PrefixAnswerer),
            worker_config(),
            &tx,
        ));

        let mut callers = Vec::new();
        for c in 0..10 {
            let gateway = gateway.clone();
            callers.push(tokio::spawn(async move {
                let me = session(&format!("caller-{}", c));
                let mut expected = HashMap::new();
                for q in 0..100 {
                    let question = format!("caller {} question {}", c, q);
                    let id = gateway.submit(&question, &me).await.unwrap();
                    expected.insert(id, format!("answer: {}", question));
                }

                let mut stream = Box::pin(gateway.stream_results(me));
                let mut seen = HashSet::new();
                while seen.len() < expected.len() {
                    let result = stream.next().await.unwrap();
                    let wanted = expected
                        .get(&result.query_id)
                        .expect("result routed to the wrong caller");
                    assert_eq!(&result.payload, wanted);
                    assert!(seen.insert(result.query_id), "result delivered twice");
                }
            }));
        }

        tokio::time::timeout(Duration::from_secs(120), async {
            for caller in callers {
                caller.await.unwrap();
            }
        })
        .await
        .expect("callers did not receive all results");

        let stats = gateway.stats().await.unwrap();
        assert_eq!(stats.store.pending, 0);
        assert_eq!(stats.store.orphans, 0);
        assert_eq!(stats.requests.dead_lettered, 0);

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_duplicate_response_is_delivered_once() {
        let queue = memory_queue(Duration::from_secs(30));
        let gateway = DispatchGateway::new(queue.clone(), gateway_config());
        let tx = shutdown::channel();
        let handles = gateway.start_background(&tx).unwrap();

        let alice = session("alice");
        let id = gateway.submit("What is heredity?", &alice).await.unwrap();
        publish_response(&queue, id, "first").await;
        publish_response(&queue, id, "second").await;

        let mut stream = Box::pin(gateway.stream_results(alice.clone()));
        let result = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.payload, "first");
        drop(stream);

        // Give the fan-in time to consume the duplicate
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(gateway
            .poll_results(&alice, Duration::from_millis(100))
            .await
            .is_empty());
        assert_eq!(queue.stats("query_responses").await.unwrap().ready, 0);

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reconnected_stream_resumes_where_it_left_off() {
        let queue = memory_queue(Duration::from_secs(30));
        let gateway = DispatchGateway::new(queue.clone(), gateway_config());
        let tx = shutdown::channel();
        let handles = gateway.start_background(&tx).unwrap();

        let alice = session("alice");
        let first = gateway.submit("one", &alice).await.unwrap();
        let second = gateway.submit("two", &alice).await.unwrap();
        publish_response(&queue, first, "1").await;
        publish_response(&queue, second, "2").await;

        let mut stream = Box::pin(gateway.stream_results(alice.clone()));
        let got_first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        drop(stream);

        let mut stream = Box::pin(gateway.stream_results(alice));
        let got_second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();

        let ids: HashSet<QueryId> = [got_first.query_id, got_second.query_id].into();
        assert_eq!(ids, [first, second].into());

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_other_callers_see_nothing() {
        let queue = memory_queue(Duration::from_secs(30));
        let gateway = DispatchGateway::new(queue.clone(), gateway_config());
        let tx = shutdown::channel();
        let handles = gateway.start_background(&tx).unwrap();

        let id = gateway.submit("private", &session("alice")).await.unwrap();
        publish_response(&queue, id, "for alice").await;

        let bob = session("bob");
        assert!(gateway
            .poll_results(&bob, Duration::from_millis(200))
            .await
            .is_empty());

        let alice_results = gateway
            .poll_results(&session("alice"), Duration::from_secs(5))
            .await;
        assert_eq!(alice_results.len(), 1);
        assert_eq!(alice_results[0].query_id, id);

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_query_from_crashed_worker_is_answered_after_timeout() {
        let queue = memory_queue(Duration::from_millis(100));
        let gateway = DispatchGateway::new(queue.clone(), gateway_config());
        let tx = shutdown::channel();
        let mut handles = gateway.start_background(&tx).unwrap();

        let alice = session("alice");
        let id = gateway.submit("survive a crash", &alice).await.unwrap();

        // A worker takes the query and dies without acknowledging it
        let abandoned = queue
            .receive("query_requests", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        drop(abandoned);

        handles.extend(WorkerPool::spawn(
            1,
            queue.clone(),
            Arc::new(PrefixAnswerer),
            worker_config(),
            &tx,
        ));

        let results = gateway.poll_results(&alice, Duration::from_secs(10)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].query_id, id);
        assert_eq!(results[0].payload, "answer: survive a crash");

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_result_can_be_claimed_by_id() {
        let queue = memory_queue(Duration::from_secs(30));
        let gateway = DispatchGateway::new(queue.clone(), gateway_config());
        let tx = shutdown::channel();
        let handles = gateway.start_background(&tx).unwrap();

        let id = gateway.submit("claim me", &session("alice")).await.unwrap();
        assert!(gateway.result_for(id).is_none());

        publish_response(&queue, id, "claimed").await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let result = loop {
            if let Some(result) = gateway.result_for(id) {
                break result;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(result.payload, "claimed");

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let queue = memory_queue(Duration::from_secs(30));
        let gateway = DispatchGateway::new(queue.clone(), gateway_config());

        let err = gateway.submit("   ", &session("alice")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(queue.stats("query_requests").await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn test_second_fan_in_is_refused() {
        let gateway = DispatchGateway::new(memory_queue(Duration::from_secs(30)), gateway_config());
        let tx = shutdown::channel();

        let handles = gateway.start_background(&tx).unwrap();
        assert!(gateway.clone().start_background(&tx).is_err());

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    /// Queue whose publishes always fail.
    struct DownQueue;

    #[async_trait::async_trait]
    impl DurableQueue for DownQueue {
        async fn publish(&self, _channel: &str, _payload: &[u8]) -> AppResult<i64> {
            Err(AppError::Queue("queue unavailable".to_string()))
        }

        async fn receive(&self, _channel: &str, _wait: Duration) -> AppResult<Option<Delivery>> {
            Ok(None)
        }

        async fn ack(&self, _delivery: &Delivery) -> AppResult<()> {
            Ok(())
        }

        async fn release(
            &self,
            _delivery: &Delivery,
            _delay: Duration,
            _reason: &str,
        ) -> AppResult<()> {
            Ok(())
        }

        async fn dead_letter(&self, _delivery: &Delivery, _reason: &str) -> AppResult<()> {
            Ok(())
        }

        async fn dead_letters(&self, _channel: &str, _limit: usize) -> AppResult<Vec<DeadLetter>> {
            Ok(Vec::new())
        }

        async fn stats(&self, _channel: &str) -> AppResult<QueueStats> {
            Ok(QueueStats::default())
        }
    }

    #[tokio::test]
    async fn test_failed_publish_is_reported_and_rolled_back() {
        let gateway = DispatchGateway::new(Arc::new(DownQueue), gateway_config());

        let err = gateway.submit("lost?", &session("alice")).await.unwrap_err();
        assert!(matches!(err, AppError::Queue(_)));
        assert_eq!(gateway.store().stats().pending, 0);
    }
}
