
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::Code;

use build_coordinator::blob::{BlobStore, MemoryBlobStore};
use build_coordinator::config::OutboxConfig;
use build_coordinator::error::Result;
use build_coordinator::outbox::{
    DeliveryReport, Outbox, OutboxCounter, OutboxDeliveryService, OutboxMessage,
    OutboxMessageHandler,
};
use build_coordinator::platform::{
    BuildResult, OutboxPlatformService, PlatformOutboxHandler, PlatformService, PLATFORM_OUTBOX,
};
use build_coordinator::store::{MemoryRepository, Repository};

use test_harness::{assert_eventually, ScriptedPlatformApi};

struct OutboxEnv {
    messages: MemoryRepository<OutboxMessage>,
    blobs: MemoryBlobStore,
    outbox: Outbox,
    platform: OutboxPlatformService,
    api: Arc<ScriptedPlatformApi>,
    delivery: OutboxDeliveryService,
}

impl OutboxEnv {
    fn new(config: OutboxConfig) -> Self {
        let messages: MemoryRepository<OutboxMessage> = MemoryRepository::new();
        let counters: MemoryRepository<OutboxCounter> = MemoryRepository::new();
        let blobs = MemoryBlobStore::new();
        let outbox = Outbox::new(
            Arc::new(messages.clone()),
            Arc::new(counters),
            Arc::new(blobs.clone()),
            config.clone(),
        );
        let api = Arc::new(ScriptedPlatformApi::new());
        let delivery =
            OutboxDeliveryService::new(Arc::new(messages.clone()), Arc::new(blobs.clone()), config)
                .with_handler(Arc::new(PlatformOutboxHandler::new(api.clone())));
        Self {
            messages,
            blobs,
            platform: OutboxPlatformService::new(outbox.clone()),
            outbox,
            api,
            delivery,
        }
    }

    async fn stored(&self) -> Vec<OutboxMessage> {
        let mut all = self
            .messages
            .get_all(&|_: &OutboxMessage| true)
            .await
            .unwrap();
        all.sort_by(|a, b| (&a.group_id, a.index).cmp(&(&b.group_id, b.index)));
        all
    }
}

fn delivered(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(m, k)| (m.to_string(), k.to_string()))
        .collect()
}

#[tokio::test]
async fn test_messages_are_indexed_per_group() {
    let env = OutboxEnv::new(OutboxConfig::default());
    env.platform.build_started("e1", "b1").await.unwrap();
    env.platform.build_started("e2", "b2").await.unwrap();
    env.platform.build_canceled("e1", "b1").await.unwrap();

    let stored = env.stored().await;
    let indices: Vec<(&str, u64, &str)> = stored
        .iter()
        .map(|m| (m.group_id.as_str(), m.index, m.method.as_str()))
        .collect();
    assert_eq!(
        indices,
        vec![
            ("e1", 0, "BuildStarted"),
            ("e1", 1, "BuildCanceled"),
            ("e2", 0, "BuildStarted"),
        ]
    );
    assert!(stored.iter().all(|m| m.outbox_name == PLATFORM_OUTBOX));
    assert!(stored.iter().all(|m| m.attempts == 0 && !m.content_in_blob));
}

#[tokio::test]
async fn test_retryable_failure_blocks_only_its_group() {
    let env = OutboxEnv::new(OutboxConfig::default());
    env.platform.build_started("e1", "b1").await.unwrap();
    env.platform
        .build_completed("e1", "b1", 10, 0.5)
        .await
        .unwrap();
    env.platform.build_started("e2", "b2").await.unwrap();

    // First attempt (e1's BuildStarted) hits a transient error.
    env.api.fail_with(&[Code::Internal]);
    let report = env.delivery.process_messages().await.unwrap();
    assert_eq!(
        report,
        DeliveryReport {
            sent: 1,
            dropped: 0,
            retried: 1,
            aborted: false,
        }
    );
    assert_eq!(env.api.delivered(), delivered(&[("BuildStarted", "b2")]));

    let stored = env.stored().await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].method, "BuildStarted");
    assert_eq!(stored[0].attempts, 1);
    assert_eq!(stored[1].attempts, 0);

    let report = env.delivery.process_messages().await.unwrap();
    assert_eq!(report.sent, 2);
    assert_eq!(
        env.api.delivered(),
        delivered(&[
            ("BuildStarted", "b2"),
            ("BuildStarted", "b1"),
            ("BuildCompleted", "b1"),
        ])
    );
    assert!(env.stored().await.is_empty());
}

#[tokio::test]
async fn test_connectivity_failure_aborts_pass() {
    let env = OutboxEnv::new(OutboxConfig::default());
    env.platform.build_started("e1", "b1").await.unwrap();
    env.platform.build_started("e2", "b2").await.unwrap();

    env.api.fail_with(&[Code::Unavailable]);
    let report = env.delivery.process_messages().await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.sent, 0);
    assert_eq!(env.api.attempts(), 1, "no other group is tried");

    let stored = env.stored().await;
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|m| m.attempts == 0));

    let report = env.delivery.process_messages().await.unwrap();
    assert_eq!(report.sent, 2);
    assert!(!report.aborted);
}

#[tokio::test]
async fn test_permanent_failure_drops_and_continues() {
    let env = OutboxEnv::new(OutboxConfig::default());
    env.platform.build_started("e1", "b1").await.unwrap();
    env.platform.build_canceled("e1", "b1").await.unwrap();

    env.api.fail_with(&[Code::InvalidArgument]);
    let report = env.delivery.process_messages().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(env.api.delivered(), delivered(&[("BuildCanceled", "b1")]));
    assert!(env.stored().await.is_empty());
}

#[tokio::test]
async fn test_expired_retryable_message_is_dropped() {
    let env = OutboxEnv::new(OutboxConfig {
        message_expiration: Duration::ZERO,
        ..OutboxConfig::default()
    });
    env.platform.build_started("e1", "b1").await.unwrap();
    env.platform.build_canceled("e1", "b1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    env.api.fail_with(&[Code::DeadlineExceeded]);
    let report = env.delivery.process_messages().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(report.sent, 1);
    assert!(env.stored().await.is_empty());
}

#[tokio::test]
async fn test_undeliverable_message_halts_group_for_one_pass() {
    let env = OutboxEnv::new(OutboxConfig::default());
    env.outbox
        .enqueue_message(PLATFORM_OUTBOX, "NoSuchMethod", "e1", Some("{}".into()))
        .await
        .unwrap();
    env.platform.build_started("e1", "b1").await.unwrap();

    let report = env.delivery.process_messages().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(env.stored().await.len(), 1);

    let report = env.delivery.process_messages().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(env.api.delivered(), delivered(&[("BuildStarted", "b1")]));
}

#[tokio::test]
async fn test_oversized_content_goes_through_blob_store() {
    let env = OutboxEnv::new(OutboxConfig {
        max_document_size: 128,
        ..OutboxConfig::default()
    });
    let results: Vec<BuildResult> = (0..20)
        .map(|i| BuildResult {
            corpus_id: "c1".into(),
            text_id: format!("t{}", i),
            refs: vec![format!("ref{}", i)],
            translation: "a fairly long translated segment".into(),
        })
        .collect();
    env.platform.insert_results("e1", results).await.unwrap();

    let stored = env.stored().await;
    assert_eq!(stored.len(), 1);
    let message = &stored[0];
    assert!(message.content_in_blob);
    assert!(message.content.is_none());
    assert!(env.blobs.exists(&message.blob_path()).await.unwrap());

    let report = env.delivery.process_messages().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(env.api.delivered(), delivered(&[("InsertResults", "e1")]));
    assert!(env.blobs.is_empty().await, "blob removed after delivery");
}

#[tokio::test]
async fn test_missing_blob_is_dropped() {
    let env = OutboxEnv::new(OutboxConfig {
        max_document_size: 8,
        ..OutboxConfig::default()
    });
    env.platform.build_started("e1", "b1").await.unwrap();
    let message = env.stored().await.remove(0);
    assert!(message.content_in_blob);
    env.blobs.delete(&message.blob_path()).await.unwrap();

    let report = env.delivery.process_messages().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert!(env.api.delivered().is_empty());
    assert!(env.stored().await.is_empty());
}

struct CountingHandler {
    name: &'static str,
    sent: AtomicUsize,
    cleaned: AtomicUsize,
}

#[async_trait]
impl OutboxMessageHandler for CountingHandler {
    fn name(&self) -> &str {
        self.name
    }

    async fn send_message(&self, _message: &OutboxMessage, content: Option<&str>) -> Result<()> {
        assert_eq!(content, Some("payload"));
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup_message(&self, _message: &OutboxMessage) -> Result<()> {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_handlers_are_routed_by_outbox_name() {
    let messages: MemoryRepository<OutboxMessage> = MemoryRepository::new();
    let blobs = MemoryBlobStore::new();
    let outbox = Outbox::new(
        Arc::new(messages.clone()),
        Arc::new(MemoryRepository::<OutboxCounter>::new()),
        Arc::new(blobs.clone()),
        OutboxConfig::default(),
    );
    let handler = Arc::new(CountingHandler {
        name: "reports",
        sent: AtomicUsize::new(0),
        cleaned: AtomicUsize::new(0),
    });
    let delivery = OutboxDeliveryService::new(
        Arc::new(messages.clone()),
        Arc::new(blobs),
        OutboxConfig::default(),
    )
    .with_handler(handler.clone());

    outbox
        .enqueue_message("reports", "Publish", "g1", Some("payload".into()))
        .await
        .unwrap();
    outbox
        .enqueue_message("unknown", "Publish", "g1", Some("payload".into()))
        .await
        .unwrap();

    let report = delivery.process_messages().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.dropped, 1, "no handler for the unknown outbox");
    assert_eq!(handler.sent.load(Ordering::SeqCst), 1);
    assert_eq!(handler.cleaned.load(Ordering::SeqCst), 1);
    assert!(messages.is_empty().await);
}

#[tokio::test]
async fn test_delivery_loop_picks_up_new_messages() {
    let env = Arc::new(OutboxEnv::new(OutboxConfig::default()));
    let shutdown = CancellationToken::new();

    let runner = env.clone();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { runner.delivery.run(token).await });

    // Let the loop finish its first (empty) pass.
    tokio::time::sleep(Duration::from_millis(50)).await;
    env.platform.build_started("e1", "b1").await.unwrap();

    assert_eventually(
        || async { env.api.delivered().len() == 1 },
        Duration::from_secs(2),
        "new message should be delivered without waiting for the poll timeout",
    )
    .await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("delivery loop stops on shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_blocked_group_waits_for_poll_before_retrying() {
    let env = Arc::new(OutboxEnv::new(OutboxConfig {
        poll_timeout: Duration::from_millis(300),
        ..OutboxConfig::default()
    }));
    env.platform.build_started("e1", "b1").await.unwrap();
    env.api.fail_with(&[Code::ResourceExhausted, Code::ResourceExhausted]);

    let shutdown = CancellationToken::new();
    let runner = env.clone();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { runner.delivery.run(token).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(env.api.attempts(), 1, "no retry before the poll timeout");

    assert_eventually(
        || async { env.api.delivered().len() == 1 },
        Duration::from_secs(3),
        "message should go through once the endpoint recovers",
    )
    .await;
    assert_eq!(env.api.attempts(), 3);
    assert!(env.stored().await.is_empty());

    shutdown.cancel();
    handle.await.unwrap();
}
