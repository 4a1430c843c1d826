#[cfg(test)]
mod tests {
    use crate::capture::{CaptureHandler, Callbacks, Notification};
    use crate::client::Client;
    use crate::lifecycle::{EventOptions, Lifecycle, Sequencer};
    use crate::listener::RealtimeListener;
    use crate::ports::*;
    use crate::queue::DispatchQueue;
    use crate::retry::Backoff;
    use crate::worker::{DeliveryLedger, DeliveryWorker};
    use beacon_types::config::*;
    use beacon_types::event::{Cost, Event, EventKind, EventPayload};
    use beacon_types::inbound::{InboundEvent, InboundFrame};
    use beacon_types::properties::properties;
    use beacon_types::session::LifecycleState;
    use beacon_types::BeaconError;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::rc::Rc;
    use std::time::Duration;
    use tokio::time::Instant;

    // ─── Harness ─────────────────────────────────────────────

    /// Current-thread runtime with a paused clock, inside a LocalSet.
    fn run_local<F: Future>(f: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        tokio::task::LocalSet::new().block_on(&rt, f)
    }

    /// Replays scripted results (Accepted once exhausted) and records every
    /// attempted batch.
    #[derive(Default)]
    struct ScriptedTransport {
        script: RefCell<VecDeque<DeliveryResult>>,
        attempts: RefCell<Vec<Vec<Event>>>,
    }

    impl ScriptedTransport {
        fn with_script(results: Vec<DeliveryResult>) -> Rc<Self> {
            Rc::new(Self {
                script: RefCell::new(results.into()),
                attempts: RefCell::new(Vec::new()),
            })
        }

        fn attempt_count(&self) -> usize {
            self.attempts.borrow().len()
        }

        /// Events of every attempt, in send order.
        fn delivered(&self) -> Vec<Event> {
            self.attempts.borrow().iter().flatten().cloned().collect()
        }
    }

    #[async_trait(?Send)]
    impl TransportPort for ScriptedTransport {
        async fn send_batch(&self, events: &[Event]) -> DeliveryResult {
            self.attempts.borrow_mut().push(events.to_vec());
            self.script
                .borrow_mut()
                .pop_front()
                .unwrap_or(DeliveryResult::Accepted)
        }

        fn transport_name(&self) -> &str {
            "scripted"
        }
    }

    /// Never answers.
    struct StalledTransport;

    #[async_trait(?Send)]
    impl TransportPort for StalledTransport {
        async fn send_batch(&self, _events: &[Event]) -> DeliveryResult {
            futures::future::pending().await
        }

        fn transport_name(&self) -> &str {
            "stalled"
        }
    }

    /// Panics on every send.
    struct PanickingTransport;

    #[async_trait(?Send)]
    impl TransportPort for PanickingTransport {
        async fn send_batch(&self, _events: &[Event]) -> DeliveryResult {
            panic!("transport bug")
        }

        fn transport_name(&self) -> &str {
            "panicking"
        }
    }

    type Connection = beacon_types::Result<Vec<beacon_types::Result<InboundFrame>>>;

    /// Each `open_stream` consumes one scripted connection; once the script
    /// runs out the connection stays open and silent.
    #[derive(Default)]
    struct ScriptedStream {
        connections: RefCell<VecDeque<Connection>>,
        opened: Cell<u32>,
    }

    impl ScriptedStream {
        fn with_connections(connections: Vec<Connection>) -> Rc<Self> {
            Rc::new(Self {
                connections: RefCell::new(connections.into()),
                opened: Cell::new(0),
            })
        }
    }

    #[async_trait(?Send)]
    impl StreamPort for ScriptedStream {
        async fn open_stream(&self, _session_id: &str) -> beacon_types::Result<InboundStream> {
            self.opened.set(self.opened.get() + 1);
            match self.connections.borrow_mut().pop_front() {
                Some(Ok(frames)) => Ok(Box::pin(futures::stream::iter(frames))),
                Some(Err(e)) => Err(e),
                None => Ok(Box::pin(futures::stream::pending())),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<InboundEvent>>,
        errors: RefCell<Vec<BeaconError>>,
    }

    impl CaptureHandler for Recorder {
        fn on_event(&self, event: InboundEvent) {
            self.events.borrow_mut().push(event);
        }

        fn on_error(&self, error: BeaconError) {
            self.errors.borrow_mut().push(error);
        }
    }

    fn inbound(name: &str) -> InboundEvent {
        InboundEvent {
            event: name.to_string(),
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            conversation_id: None,
            event_id: format!("evt-{}", name),
            origin_event_id: None,
            properties: Default::default(),
            traits: None,
        }
    }

    fn lifecycle(id: &str) -> Lifecycle {
        Lifecycle::new(SessionConfig::default().with_id(id), Sequencer::new())
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind()).collect()
    }

    fn fast_delivery() -> DeliveryConfig {
        DeliveryConfig {
            max_batch_size: 10,
            batch_timeout_ms: 10,
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            max_total_wait_ms: 10_000,
            jitter: 0.0,
            flush_timeout_ms: 5_000,
        }
    }

    fn client_config() -> ClientConfig {
        let mut config = ClientConfig::new("key", "project");
        config.delivery = fast_delivery();
        config.listener = ListenerConfig {
            max_reconnects: 2,
            initial_backoff_ms: 50,
            max_backoff_ms: 200,
            ack_grace_ms: 1_000,
        };
        config
    }

    fn track_event(name: &str, seq: u64) -> Event {
        Event {
            seq,
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            conversation_id: None,
            payload: EventPayload::Track {
                event: name.to_string(),
            },
            properties: Default::default(),
            traits: None,
            cost: None,
        }
    }

    // ─── Sequencer / EventOptions Tests ──────────────────────

    #[test]
    fn test_sequencer_is_shared_and_monotonic() {
        let a = Sequencer::new();
        let b = a.clone();
        assert_eq!(a.last(), 0);
        assert_eq!(a.next(), 1);
        assert_eq!(b.next(), 2);
        assert_eq!(a.last(), 2);
    }

    #[test]
    fn test_event_options_builder() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let opts = EventOptions::new()
            .at(at)
            .property("plan", "pro")
            .properties(properties([("seats", 3)]))
            .cost(Cost::new("gpt-4o", 10, 5));
        assert_eq!(opts.timestamp, Some(at));
        assert_eq!(opts.properties.len(), 2);
        assert_eq!(opts.cost.unwrap().total_tokens(), 15);
    }

    // ─── Lifecycle Tests ─────────────────────────────────────

    #[test]
    fn test_start_session_carries_identity_and_attributes() {
        let config = SessionConfig::default()
            .with_id("s1")
            .with_user("u1")
            .with_device("d1")
            .with_attributes(properties([("region", "eu")]));
        let mut lc = Lifecycle::new(config, Sequencer::new());

        let events = lc
            .start_session(EventOptions::new().property("source", "web"))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].payload,
            EventPayload::SessionStart {
                user_id: Some("u1".to_string()),
                device_id: Some("d1".to_string()),
            }
        );
        assert_eq!(events[0].properties.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(lc.state(), LifecycleState::Active);
    }

    #[test]
    fn test_start_session_twice_fails_without_events() {
        let mut lc = lifecycle("s1");
        lc.start_session(EventOptions::new()).unwrap();
        let err = lc.start_session(EventOptions::new()).unwrap_err();
        assert!(matches!(err, BeaconError::InvalidState(_)));
        assert_eq!(lc.state(), LifecycleState::Active);
    }

    #[test]
    fn test_track_event_lazily_starts_session() {
        let mut lc = lifecycle("s1");
        let events = lc.track_event("clicked", None, EventOptions::new()).unwrap();
        assert_eq!(kinds(&events), vec![EventKind::SessionStart, EventKind::Track]);
        assert!(events[0].seq < events[1].seq);
        assert_eq!(events[1].conversation_id, None);
    }

    #[test]
    fn test_track_event_attaches_latest_open_conversation() {
        let mut lc = lifecycle("s1");
        lc.start_conversation(Some("c1"), EventOptions::new()).unwrap();
        lc.start_conversation(Some("c2"), EventOptions::new()).unwrap();

        let events = lc.track_event("clicked", None, EventOptions::new()).unwrap();
        assert_eq!(events[0].conversation_id.as_deref(), Some("c2"));

        let events = lc.track_event("clicked", Some("c1"), EventOptions::new()).unwrap();
        assert_eq!(events[0].conversation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_calls_on_ended_session_fail() {
        let mut lc = lifecycle("s1");
        lc.start_session(EventOptions::new()).unwrap();
        lc.end_session(EventOptions::new()).unwrap();

        assert!(lc.track_event("x", None, EventOptions::new()).is_err());
        assert!(lc.start_conversation(None, EventOptions::new()).is_err());
        assert!(lc
            .track_conversation_turn(None, "hi", "hello", EventOptions::new())
            .is_err());
        assert!(lc.end_session(EventOptions::new()).is_err());
        assert!(lc.start_session(EventOptions::new()).is_err());
    }

    #[test]
    fn test_end_session_before_start_fails() {
        let mut lc = lifecycle("s1");
        let err = lc.end_session(EventOptions::new()).unwrap_err();
        assert!(matches!(err, BeaconError::InvalidState(_)));
        assert_eq!(lc.state(), LifecycleState::Unstarted);
    }

    #[test]
    fn test_turn_without_conversation_uses_one_default() {
        let mut lc = lifecycle("s1");
        let (id, events) = lc
            .track_conversation_turn(None, "hi", "hello", EventOptions::new())
            .unwrap();
        assert_eq!(id, "s1:default-1");
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::SessionStart,
                EventKind::ConversationStart,
                EventKind::ConversationTurn
            ]
        );

        let (again, events) = lc
            .track_conversation_turn(None, "more", "sure", EventOptions::new())
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(kinds(&events), vec![EventKind::ConversationTurn]);
        match &events[0].payload {
            EventPayload::ConversationTurn { turn, user, .. } => {
                assert_eq!(*turn, 2);
                assert_eq!(user, "more");
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(lc.conversations().len(), 1);
    }

    #[test]
    fn test_default_conversation_after_previous_ended() {
        let mut lc = lifecycle("s1");
        lc.track_conversation_turn(None, "a", "b", EventOptions::new()).unwrap();
        lc.end_conversation(None, EventOptions::new()).unwrap();
        let (id, _) = lc
            .track_conversation_turn(None, "c", "d", EventOptions::new())
            .unwrap();
        assert_eq!(id, "s1:default-2");
    }

    #[test]
    fn test_turn_on_unknown_conversation_leaves_no_trace() {
        let mut lc = lifecycle("s1");
        let err = lc
            .track_conversation_turn(Some("nope"), "hi", "hello", EventOptions::new())
            .unwrap_err();
        assert!(matches!(err, BeaconError::InvalidState(_)));
        assert_eq!(lc.state(), LifecycleState::Unstarted);
        assert!(lc.conversations().is_empty());
    }

    #[test]
    fn test_end_session_ends_open_conversations_in_start_order() {
        let mut lc = lifecycle("s1");
        for id in ["c1", "c2", "c3"] {
            lc.start_conversation(Some(id), EventOptions::new()).unwrap();
        }
        lc.end_conversation(Some("c2"), EventOptions::new()).unwrap();

        let events = lc.end_session(EventOptions::new()).unwrap();
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::ConversationEnd,
                EventKind::ConversationEnd,
                EventKind::SessionEnd
            ]
        );
        assert_eq!(events[0].conversation_id.as_deref(), Some("c1"));
        assert_eq!(events[1].conversation_id.as_deref(), Some("c3"));
        assert_eq!(lc.open_conversations().count(), 0);
    }

    #[test]
    fn test_end_conversation_errors() {
        let mut lc = lifecycle("s1");
        assert!(lc.end_conversation(None, EventOptions::new()).is_err());
        assert!(lc.end_conversation(Some("c1"), EventOptions::new()).is_err());

        lc.start_conversation(Some("c1"), EventOptions::new()).unwrap();
        lc.track_conversation_turn(Some("c1"), "a", "b", EventOptions::new())
            .unwrap();
        let events = lc.end_conversation(None, EventOptions::new()).unwrap();
        assert_eq!(events[0].payload, EventPayload::ConversationEnd { turn_count: 1 });
        assert!(lc.end_conversation(Some("c1"), EventOptions::new()).is_err());
        assert!(lc
            .track_conversation_turn(Some("c1"), "a", "b", EventOptions::new())
            .is_err());
    }

    #[test]
    fn test_start_conversation_rejects_duplicate_id() {
        let mut lc = lifecycle("s1");
        let (id, events) = lc.start_conversation(Some("c1"), EventOptions::new()).unwrap();
        assert_eq!(id, "c1");
        assert_eq!(events.len(), 2);
        assert!(lc.start_conversation(Some("c1"), EventOptions::new()).is_err());

        let (generated, _) = lc.start_conversation(None, EventOptions::new()).unwrap();
        assert!(!generated.is_empty());
        assert_ne!(generated, "c1");
    }

    #[test]
    fn test_identify_updates_user_and_carries_traits() {
        let mut lc = lifecycle("s1");
        let events = lc
            .identify("u42", properties([("email", "a@b.c")]), EventOptions::new())
            .unwrap();
        assert_eq!(kinds(&events), vec![EventKind::SessionStart, EventKind::Identify]);
        assert_eq!(events[1].traits.as_ref().map(|t| t.len()), Some(1));
        assert_eq!(lc.session().user_id.as_deref(), Some("u42"));

        let events = lc.track_event("x", None, EventOptions::new()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_identify_and_alias_accepted_after_end() {
        let mut lc = lifecycle("s1");
        lc.start_session(EventOptions::new()).unwrap();
        lc.end_session(EventOptions::new()).unwrap();

        let events = lc
            .identify("u1", Default::default(), EventOptions::new())
            .unwrap();
        assert_eq!(events[0].traits, None);
        let events = lc.alias("u1", "anon-7", EventOptions::new()).unwrap();
        assert_eq!(
            events[0].payload,
            EventPayload::Alias {
                user_id: "u1".to_string(),
                previous_id: "anon-7".to_string(),
            }
        );
    }

    #[test]
    fn test_caller_timestamp_is_kept() {
        let at = Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap();
        let mut lc = lifecycle("s1");
        let events = lc.track_event("x", None, EventOptions::new().at(at)).unwrap();
        assert!(events.iter().all(|e| e.timestamp == at));
    }

    // ─── Backoff Tests ───────────────────────────────────────

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            jitter: 0.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let backoff = Backoff {
            initial: Duration::from_millis(1_000),
            max: Duration::from_secs(60),
            jitter: 0.2,
        };
        for _ in 0..200 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_millis(800), "{:?}", d);
            assert!(d <= Duration::from_millis(1_200), "{:?}", d);
        }
    }

    // ─── DispatchQueue Tests ─────────────────────────────────

    #[test]
    fn test_queue_batches_in_fifo_order() {
        run_local(async {
            let queue = DispatchQueue::new(&QueueConfig::default());
            for seq in 1..=5 {
                queue.enqueue(track_event("e", seq)).await.unwrap();
            }
            let batch = queue.next_batch(3, Duration::from_millis(10)).await.unwrap();
            assert_eq!(batch.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
            let batch = queue.next_batch(3, Duration::from_millis(10)).await.unwrap();
            assert_eq!(batch.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
            assert!(queue.is_empty());
        });
    }

    #[test]
    fn test_queue_drop_oldest_keeps_newest() {
        run_local(async {
            let queue = DispatchQueue::new(&QueueConfig {
                capacity: 3,
                backpressure: Backpressure::DropOldest,
            });
            for seq in 1..=6 {
                queue.enqueue(track_event("e", seq)).await.unwrap();
            }
            assert_eq!(queue.len(), 3);
            assert_eq!(queue.dropped_count(), 3);
            let batch = queue.next_batch(10, Duration::from_millis(1)).await.unwrap();
            assert_eq!(batch.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5, 6]);
        });
    }

    #[test]
    fn test_queue_block_waits_for_space() {
        run_local(async {
            let queue = DispatchQueue::new(&QueueConfig {
                capacity: 1,
                backpressure: Backpressure::block(),
            });
            queue.enqueue(track_event("e", 1)).await.unwrap();

            let consumer = queue.clone();
            tokio::task::spawn_local(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                consumer.next_batch(1, Duration::ZERO).await
            });

            let started = Instant::now();
            queue.enqueue(track_event("e", 2)).await.unwrap();
            assert!(started.elapsed() >= Duration::from_millis(100));
            assert_eq!(queue.dropped_count(), 0);
            assert_eq!(queue.len(), 1);
        });
    }

    #[test]
    fn test_queue_block_timeout_drops_incoming() {
        run_local(async {
            let queue = DispatchQueue::new(&QueueConfig {
                capacity: 1,
                backpressure: Backpressure::Block { timeout_ms: 200 },
            });
            queue.enqueue(track_event("e", 1)).await.unwrap();
            queue.enqueue(track_event("e", 2)).await.unwrap();

            assert_eq!(queue.dropped_count(), 1);
            let batch = queue.next_batch(5, Duration::ZERO).await.unwrap();
            assert_eq!(batch[0].seq, 1);
        });
    }

    #[test]
    fn test_queue_close_drains_then_ends() {
        run_local(async {
            let queue = DispatchQueue::new(&QueueConfig::default());
            queue.enqueue(track_event("e", 1)).await.unwrap();
            queue.close();

            let err = queue.enqueue(track_event("e", 2)).await.unwrap_err();
            assert!(matches!(err, BeaconError::QueueClosed));
            assert_eq!(queue.next_batch(10, Duration::from_secs(5)).await.unwrap().len(), 1);
            assert!(queue.next_batch(10, Duration::from_secs(5)).await.is_none());
        });
    }

    #[test]
    fn test_queue_next_batch_waits_for_window() {
        run_local(async {
            let queue = DispatchQueue::new(&QueueConfig::default());
            let producer = queue.clone();
            tokio::task::spawn_local(async move {
                producer.enqueue(track_event("e", 1)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                producer.enqueue(track_event("e", 2)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(500)).await;
                producer.enqueue(track_event("e", 3)).await.unwrap();
            });

            let batch = queue.next_batch(10, Duration::from_millis(100)).await.unwrap();
            assert_eq!(batch.len(), 2);
            let batch = queue.next_batch(10, Duration::from_millis(100)).await.unwrap();
            assert_eq!(batch[0].seq, 3);
        });
    }

    // ─── DeliveryWorker Tests ────────────────────────────────

    async fn deliver_all(
        transport: Rc<dyn TransportPort>,
        handler: Option<Rc<dyn CaptureHandler>>,
        config: DeliveryConfig,
        events: Vec<Event>,
    ) -> Rc<RefCell<DeliveryLedger>> {
        let queue = DispatchQueue::new(&QueueConfig::default());
        let ledger = Rc::new(RefCell::new(DeliveryLedger::default()));
        let worker = DeliveryWorker::new(queue.clone(), transport, handler, config, ledger.clone());
        let join = tokio::task::spawn_local(worker.run());
        for event in events {
            queue.enqueue(event).await.unwrap();
        }
        queue.close();
        join.await.unwrap();
        ledger
    }

    #[test]
    fn test_worker_retries_network_errors_then_delivers() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![
                DeliveryResult::NetworkError("connection reset".into()),
                DeliveryResult::NetworkError("connection reset".into()),
            ]);
            let events = (1..=3).map(|seq| track_event("e", seq)).collect();
            let ledger = deliver_all(transport.clone(), None, fast_delivery(), events).await;

            assert_eq!(transport.attempt_count(), 3);
            let attempts = transport.attempts.borrow();
            assert!(attempts.iter().all(|batch| batch.len() == 3));
            let ledger = ledger.borrow();
            assert_eq!(ledger.stats.batches_sent, 1);
            assert_eq!(ledger.stats.events_sent, 3);
            assert_eq!(ledger.stats.retries, 2);
            assert!(ledger.failures.is_empty());
        });
    }

    #[test]
    fn test_worker_does_not_retry_client_errors() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![DeliveryResult::ClientError {
                status: 400,
                message: "Error: 400 - bad payload".into(),
            }]);
            let recorder = Rc::new(Recorder::default());
            let ledger = deliver_all(
                transport.clone(),
                Some(recorder.clone()),
                fast_delivery(),
                vec![track_event("e", 7)],
            )
            .await;

            assert_eq!(transport.attempt_count(), 1);
            let ledger = ledger.borrow();
            assert_eq!(ledger.stats.batches_failed, 1);
            assert_eq!(ledger.stats.unreported_errors, 0);
            let failure = &ledger.failures[0];
            assert_eq!(failure.status, Some(400));
            assert_eq!(failure.attempts, 1);
            assert_eq!((failure.first_seq, failure.last_seq), (7, 7));

            let errors = recorder.errors.borrow();
            assert_eq!(errors.len(), 1);
            assert!(matches!(&errors[0], BeaconError::Delivery(e) if e.status == Some(400)));
        });
    }

    #[test]
    fn test_worker_gives_up_after_max_attempts() {
        run_local(async {
            let transport = ScriptedTransport::with_script(
                (0..10)
                    .map(|_| DeliveryResult::ServerError {
                        status: 503,
                        message: "Error: 503 - unavailable".into(),
                    })
                    .collect(),
            );
            let ledger = deliver_all(
                transport.clone(),
                None,
                fast_delivery(),
                vec![track_event("e", 1), track_event("e", 2)],
            )
            .await;

            assert_eq!(transport.attempt_count(), 4);
            let ledger = ledger.borrow();
            assert_eq!(ledger.stats.events_failed, 2);
            assert_eq!(ledger.stats.unreported_errors, 1);
            assert_eq!(ledger.failures[0].attempts, 4);
            assert_eq!(ledger.failures[0].status, Some(503));
        });
    }

    #[test]
    fn test_worker_honours_retry_after() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![DeliveryResult::RateLimited {
                retry_after: Some(Duration::from_secs(3)),
            }]);
            let started = Instant::now();
            let ledger =
                deliver_all(transport.clone(), None, fast_delivery(), vec![track_event("e", 1)])
                    .await;

            assert!(started.elapsed() >= Duration::from_secs(3));
            assert_eq!(transport.attempt_count(), 2);
            assert_eq!(ledger.borrow().stats.batches_sent, 1);
        });
    }

    #[test]
    fn test_worker_stops_when_total_wait_exceeded() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![DeliveryResult::RateLimited {
                retry_after: Some(Duration::from_secs(120)),
            }]);
            let ledger =
                deliver_all(transport.clone(), None, fast_delivery(), vec![track_event("e", 1)])
                    .await;

            assert_eq!(transport.attempt_count(), 1);
            let ledger = ledger.borrow();
            assert_eq!(ledger.failures.len(), 1);
            assert_eq!(ledger.failures[0].status, Some(429));
            assert!(ledger.failures[0].message.contains("retry budget"));
        });
    }

    #[test]
    fn test_worker_failure_does_not_block_next_batch() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![DeliveryResult::ClientError {
                status: 422,
                message: "Error: 422 - invalid".into(),
            }]);
            let mut config = fast_delivery();
            config.max_batch_size = 1;
            let ledger = deliver_all(
                transport.clone(),
                None,
                config,
                vec![track_event("a", 1), track_event("b", 2)],
            )
            .await;

            let ledger = ledger.borrow();
            assert_eq!(ledger.stats.batches_failed, 1);
            assert_eq!(ledger.stats.batches_sent, 1);
            assert_eq!(transport.delivered().last().map(|e| e.seq), Some(2));
        });
    }

    #[test]
    fn test_worker_survives_huge_retry_after() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![DeliveryResult::RateLimited {
                retry_after: Some(Duration::MAX),
            }]);
            let mut config = fast_delivery();
            config.max_batch_size = 1;
            let ledger = deliver_all(
                transport.clone(),
                None,
                config,
                vec![track_event("a", 1), track_event("b", 2)],
            )
            .await;

            let ledger = ledger.borrow();
            assert_eq!(ledger.failures.len(), 1);
            assert!(ledger.failures[0].message.contains("retry budget"));
            assert_eq!(ledger.stats.batches_sent, 1);
            assert_eq!(transport.delivered().last().map(|e| e.seq), Some(2));
        });
    }

    #[test]
    fn test_callbacks_without_error_closure_count_unreported() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![DeliveryResult::ClientError {
                status: 400,
                message: "Error: 400 - bad payload".into(),
            }]);
            let handler = Callbacks::new().with_on_event(|_| {});
            assert!(!handler.reports_errors());

            let ledger = deliver_all(
                transport,
                Some(Rc::new(handler)),
                fast_delivery(),
                vec![track_event("e", 1)],
            )
            .await;

            let ledger = ledger.borrow();
            assert_eq!(ledger.stats.batches_failed, 1);
            assert_eq!(ledger.stats.unreported_errors, 1);
        });
    }

    #[test]
    fn test_closed_channel_handler_counts_unreported() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![DeliveryResult::ClientError {
                status: 403,
                message: "Error: 403 - forbidden".into(),
            }]);
            let (tx, rx) = futures::channel::mpsc::unbounded::<Notification>();
            drop(rx);

            let ledger =
                deliver_all(transport, Some(Rc::new(tx)), fast_delivery(), vec![track_event("e", 1)])
                    .await;
            assert_eq!(ledger.borrow().stats.unreported_errors, 1);
        });
    }

    // ─── RealtimeListener Tests ──────────────────────────────

    #[test]
    fn test_listener_forwards_events_until_ack() {
        run_local(async {
            let stream = ScriptedStream::with_connections(vec![Ok(vec![
                Ok(InboundFrame::Event(inbound("sentiment"))),
                Ok(InboundFrame::Error {
                    code: Some("quota".into()),
                    message: "slow down".into(),
                }),
                Ok(InboundFrame::Event(inbound("summary"))),
                Ok(InboundFrame::SessionEnded { session_id: None }),
            ])]);
            let recorder = Rc::new(Recorder::default());
            let handle = RealtimeListener::new(
                stream.clone(),
                recorder.clone(),
                "s1",
                client_config().listener,
            )
            .spawn();

            assert!(handle.shutdown().await);
            let names: Vec<String> =
                recorder.events.borrow().iter().map(|e| e.event.clone()).collect();
            assert_eq!(names, vec!["sentiment", "summary"]);
            let errors = recorder.errors.borrow();
            assert!(matches!(&errors[0], BeaconError::Stream { code: Some(c), .. } if c == "quota"));
            assert_eq!(stream.opened.get(), 1);
        });
    }

    #[test]
    fn test_listener_reconnects_after_malformed_frame() {
        run_local(async {
            let stream = ScriptedStream::with_connections(vec![
                Ok(vec![
                    Ok(InboundFrame::Event(inbound("first"))),
                    Err(BeaconError::Serialization("bad frame".into())),
                ]),
                Ok(vec![
                    Ok(InboundFrame::Event(inbound("second"))),
                    Ok(InboundFrame::SessionEnded { session_id: None }),
                ]),
            ]);
            let recorder = Rc::new(Recorder::default());
            let handle = RealtimeListener::new(
                stream.clone(),
                recorder.clone(),
                "s1",
                client_config().listener,
            )
            .spawn();

            assert!(handle.shutdown().await);
            assert_eq!(stream.opened.get(), 2);
            assert_eq!(recorder.events.borrow().len(), 2);
            assert_eq!(recorder.errors.borrow().len(), 1);
        });
    }

    #[test]
    fn test_listener_gives_up_after_consecutive_failures() {
        run_local(async {
            let stream = ScriptedStream::with_connections(
                (0..5)
                    .map(|_| Err(BeaconError::Network("refused".into())))
                    .collect(),
            );
            let recorder = Rc::new(Recorder::default());
            let handle = RealtimeListener::new(
                stream.clone(),
                recorder.clone(),
                "s1",
                client_config().listener,
            )
            .spawn();

            assert!(!handle.shutdown().await);
            // max_reconnects = 2: three failed connects, then a give-up report.
            assert_eq!(stream.opened.get(), 3);
            assert_eq!(recorder.errors.borrow().len(), 4);
        });
    }

    #[test]
    fn test_listener_shutdown_without_ack_times_out() {
        run_local(async {
            let stream = ScriptedStream::with_connections(vec![]);
            let recorder = Rc::new(Recorder::default());
            let handle =
                RealtimeListener::new(stream.clone(), recorder, "s1", client_config().listener)
                    .spawn();

            let started = Instant::now();
            assert!(!handle.shutdown().await);
            assert!(started.elapsed() >= Duration::from_millis(1_000));
        });
    }

    #[test]
    fn test_channel_handler_receives_notifications() {
        run_local(async {
            let (tx, mut rx) = futures::channel::mpsc::unbounded::<Notification>();
            let stream = ScriptedStream::with_connections(vec![Ok(vec![
                Ok(InboundFrame::Event(inbound("topic"))),
                Ok(InboundFrame::SessionEnded { session_id: None }),
            ])]);
            let handle =
                RealtimeListener::new(stream, Rc::new(tx), "s1", client_config().listener).spawn();
            assert!(handle.shutdown().await);

            match rx.next().await {
                Some(Notification::Event(e)) => assert_eq!(e.event, "topic"),
                other => panic!("unexpected {:?}", other),
            }
        });
    }

    // ─── Session Facade Tests ────────────────────────────────

    #[test]
    fn test_flush_delivers_everything_in_order() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![]);
            let client = Client::new(client_config(), transport.clone()).unwrap();
            let session = client
                .create_session(SessionConfig::default().with_id("s1"), None)
                .unwrap();

            session.start_session(EventOptions::new()).await.unwrap();
            let conv = session.start_conversation(None, EventOptions::new()).await.unwrap();
            for i in 0..25 {
                session
                    .track_conversation_turn(
                        Some(conv.as_str()),
                        &format!("q{}", i),
                        &format!("a{}", i),
                        EventOptions::new(),
                    )
                    .await
                    .unwrap();
            }
            session.end_session(EventOptions::new()).await.unwrap();
            session.flush().await.unwrap();

            let delivered = transport.delivered();
            assert_eq!(delivered.len(), 29);
            assert!(delivered.windows(2).all(|w| w[0].seq < w[1].seq));
            assert_eq!(delivered.first().unwrap().kind(), EventKind::SessionStart);
            assert_eq!(delivered.last().unwrap().kind(), EventKind::SessionEnd);
            assert_eq!(session.stats().events_sent, 29);
            assert!(!session.has_errors());
        });
    }

    #[test]
    fn test_calls_after_flush_fail_with_queue_closed() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![]);
            let client = Client::new(client_config(), transport).unwrap();
            let session = client.create_session(SessionConfig::default(), None).unwrap();

            session.track_event("x", None, EventOptions::new()).await.unwrap();
            session.flush().await.unwrap();
            session.flush().await.unwrap();

            let err = session
                .track_event("y", None, EventOptions::new())
                .await
                .unwrap_err();
            assert!(matches!(err, BeaconError::QueueClosed));
            assert!(session.is_flushed());
        });
    }

    #[test]
    fn test_misuse_fails_synchronously() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![]);
            let client = Client::new(client_config(), transport.clone()).unwrap();
            let session = client.create_session(SessionConfig::default(), None).unwrap();

            assert!(session.end_session(EventOptions::new()).await.is_err());
            session.start_session(EventOptions::new()).await.unwrap();
            assert!(matches!(
                session.start_session(EventOptions::new()).await,
                Err(BeaconError::InvalidState(_))
            ));
            session.flush().await.unwrap();
            assert_eq!(transport.delivered().len(), 1);
        });
    }

    #[test]
    fn test_failures_surface_through_callbacks() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![DeliveryResult::ClientError {
                status: 401,
                message: "Error: 401 - unauthorized".into(),
            }]);
            let seen = Rc::new(RefCell::new(Vec::new()));
            let sink = seen.clone();
            let handler = Callbacks::new().with_on_error(move |e| sink.borrow_mut().push(e));

            let client = Client::new(client_config(), transport).unwrap();
            let session = client
                .create_session(SessionConfig::default(), Some(Rc::new(handler)))
                .unwrap();
            session.track_event("x", None, EventOptions::new()).await.unwrap();
            session.flush().await.unwrap();

            assert_eq!(seen.borrow().len(), 1);
            assert!(session.has_errors());
            assert_eq!(session.failures()[0].status, Some(401));
            assert_eq!(session.stats().unreported_errors, 0);
        });
    }

    #[test]
    fn test_flush_times_out_on_stalled_transport() {
        run_local(async {
            let client = Client::new(client_config(), Rc::new(StalledTransport)).unwrap();
            let session = client.create_session(SessionConfig::default(), None).unwrap();
            session.track_event("x", None, EventOptions::new()).await.unwrap();

            let err = session.flush().await.unwrap_err();
            assert!(matches!(err, BeaconError::Timeout(5_000)));
        });
    }

    #[test]
    fn test_flush_reports_crashed_worker() {
        run_local(async {
            let recorder = Rc::new(Recorder::default());
            let client = Client::new(client_config(), Rc::new(PanickingTransport)).unwrap();
            let session = client
                .create_session(SessionConfig::default(), Some(recorder.clone()))
                .unwrap();

            session.track_event("a", None, EventOptions::new()).await.unwrap();
            // Worker takes seqs 1-2 and dies on send.
            tokio::time::sleep(Duration::from_secs(1)).await;
            session.track_event("b", None, EventOptions::new()).await.unwrap();
            session.track_event("c", None, EventOptions::new()).await.unwrap();

            let err = session.flush().await.unwrap_err();
            match &err {
                BeaconError::Delivery(e) => {
                    assert_eq!(e.events, 2);
                    assert_eq!((e.first_seq, e.last_seq), (3, 4));
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(matches!(session.flush().await, Err(BeaconError::Delivery(_))));
            assert_eq!(session.pending(), 0);
            assert!(session.has_errors());
            assert_eq!(session.stats().events_failed, 2);
            assert_eq!(recorder.errors.borrow().len(), 1);
        });
    }

    #[test]
    fn test_concurrent_flush_waits_for_drain() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![
                DeliveryResult::NetworkError("connection reset".into()),
            ]);
            let client = Client::new(client_config(), transport.clone()).unwrap();
            let session = client.create_session(SessionConfig::default(), None).unwrap();
            let other = session.clone();

            session.track_event("x", None, EventOptions::new()).await.unwrap();
            let second = async {
                let result = other.flush().await;
                (result, transport.delivered().len())
            };
            let (first, (second, delivered_at_return)) = tokio::join!(session.flush(), second);

            first.unwrap();
            second.unwrap();
            // First attempt failed; the retry carried the same two events.
            assert_eq!(delivered_at_return, 4);
            assert_eq!(session.stats().events_sent, 2);
        });
    }

    #[test]
    fn test_scope_ends_and_flushes_on_error() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![]);
            let client = Client::new(client_config(), transport.clone()).unwrap();
            let session = client.create_session(SessionConfig::default(), None).unwrap();

            let result: beacon_types::Result<()> = session
                .scope(|s| async move {
                    s.track_conversation_turn(None, "hi", "hello", EventOptions::new())
                        .await?;
                    Err::<(), _>(BeaconError::Config("body failed".into()))
                })
                .await;

            assert!(matches!(result, Err(BeaconError::Config(_))));
            assert!(session.is_flushed());
            assert_eq!(session.state(), LifecycleState::Ended);
            let delivered = transport.delivered();
            assert_eq!(
                kinds(&delivered),
                vec![
                    EventKind::SessionStart,
                    EventKind::ConversationStart,
                    EventKind::ConversationTurn,
                    EventKind::ConversationEnd,
                    EventKind::SessionEnd
                ]
            );
        });
    }

    #[test]
    fn test_scope_flushes_before_resuming_panic() {
        let transport = ScriptedTransport::with_script(vec![]);
        let observed = transport.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            run_local(async move {
                let client = Client::new(client_config(), transport).unwrap();
                let session = client.create_session(SessionConfig::default(), None).unwrap();
                let explode = true;
                let _ = session
                    .scope(|s| async move {
                        s.track_event("before-panic", None, EventOptions::new()).await?;
                        if explode {
                            panic!("boom");
                        }
                        Ok::<_, BeaconError>(())
                    })
                    .await;
            })
        }));

        assert!(outcome.is_err());
        let delivered = observed.delivered();
        assert_eq!(delivered.last().map(|e| e.kind()), Some(EventKind::SessionEnd));
    }

    #[test]
    fn test_scope_without_start_only_flushes() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![]);
            let client = Client::new(client_config(), transport.clone()).unwrap();
            let session = client.create_session(SessionConfig::default(), None).unwrap();

            let value = session.scope(|_s| async { Ok(7) }).await.unwrap();
            assert_eq!(value, 7);
            assert_eq!(session.state(), LifecycleState::Unstarted);
            assert_eq!(transport.attempt_count(), 0);
        });
    }

    #[test]
    fn test_session_with_listener_waits_for_ack() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![]);
            let stream = ScriptedStream::with_connections(vec![Ok(vec![
                Ok(InboundFrame::Event(inbound("intent"))),
                Ok(InboundFrame::SessionEnded { session_id: None }),
            ])]);
            let recorder = Rc::new(Recorder::default());
            let client = Client::new(client_config(), transport)
                .unwrap()
                .with_stream(stream.clone());
            let session = client
                .create_session(SessionConfig::default(), Some(recorder.clone()))
                .unwrap();

            assert_eq!(stream.opened.get(), 0);
            session.start_session(EventOptions::new()).await.unwrap();
            session.end_session(EventOptions::new()).await.unwrap();
            session.flush().await.unwrap();

            assert_eq!(stream.opened.get(), 1);
            assert_eq!(recorder.events.borrow().len(), 1);
        });
    }

    #[test]
    fn test_empty_callbacks_disable_listener() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![]);
            let stream = ScriptedStream::with_connections(vec![]);
            let client = Client::new(client_config(), transport)
                .unwrap()
                .with_stream(stream.clone());
            let session = client
                .create_session(SessionConfig::default(), Some(Rc::new(Callbacks::new())))
                .unwrap();

            session.start_session(EventOptions::new()).await.unwrap();
            session.flush().await.unwrap();
            assert_eq!(stream.opened.get(), 0);
        });
    }

    // ─── Client Tests ────────────────────────────────────────

    #[test]
    fn test_client_rejects_invalid_config() {
        let transport = ScriptedTransport::with_script(vec![]);
        let err = Client::new(ClientConfig::new("", "project"), transport).err();
        assert!(matches!(err, Some(BeaconError::Config(_))));
    }

    #[test]
    fn test_duplicate_session_id_rejected() {
        let transport = ScriptedTransport::with_script(vec![]);
        let client = Client::new(client_config(), transport).unwrap();
        client
            .create_session(SessionConfig::default().with_id("same"), None)
            .unwrap();
        let err = client
            .create_session(SessionConfig::default().with_id("same"), None)
            .err();
        assert!(matches!(err, Some(BeaconError::InvalidState(_))));
    }

    #[test]
    fn test_sequence_numbers_unique_across_sessions() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![]);
            let client = Client::new(client_config(), transport.clone()).unwrap();
            let a = client.create_session(SessionConfig::default(), None).unwrap();
            let b = client.create_session(SessionConfig::default(), None).unwrap();

            a.track_event("x", None, EventOptions::new()).await.unwrap();
            b.track_event("y", None, EventOptions::new()).await.unwrap();
            a.flush().await.unwrap();
            b.flush().await.unwrap();

            let mut seqs: Vec<u64> = transport.delivered().iter().map(|e| e.seq).collect();
            seqs.sort_unstable();
            assert_eq!(seqs, vec![1, 2, 3, 4]);
        });
    }

    #[test]
    fn test_sessions_deliver_independently() {
        run_local(async {
            let transport = ScriptedTransport::with_script(vec![]);
            let client = Client::new(client_config(), transport.clone()).unwrap();
            let a = client.create_session(SessionConfig::default(), None).unwrap();
            let b = client.create_session(SessionConfig::default(), None).unwrap();

            a.track_event("x", None, EventOptions::new()).await.unwrap();
            b.track_event("y", None, EventOptions::new()).await.unwrap();
            a.flush().await.unwrap();

            assert!(a.is_flushed());
            assert!(!b.is_flushed());
            assert_eq!(a.stats().events_sent, 2);
            b.track_event("z", None, EventOptions::new()).await.unwrap();
            b.flush().await.unwrap();
            assert_eq!(b.stats().events_sent, 3);
        });
    }
}
