use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use notification_pipeline::{
    broker::MessageWriter,
    models::{
        message::{BrokerMessage, DlqMessage},
        notification::{Channel, Notification, Priority},
        status::{NotificationStatus, OutboxStatus},
    },
    repository::NotificationRepository,
    worker::WorkerConfig,
};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::support::{Pipeline, RecordingProvider, request, worker_config};

/// Test: A created notification is published, delivered once and committed
#[tokio::test]
async fn test_notification_flows_from_create_to_delivery() -> Result<()> {
    let pipeline = Pipeline::new(Channel::Sms, RecordingProvider::new());
    let token = CancellationToken::new();

    let notification = pipeline
        .service
        .create(request(Channel::Sms, Priority::High))
        .await?;

    let event = pipeline.repository.event_for(notification.id).unwrap();
    assert_eq!(event.topic, "sms_high");
    assert_eq!(event.status, OutboxStatus::Pending);

    assert_eq!(pipeline.publisher.run_cycle().await?, 1);
    assert_eq!(
        pipeline.repository.event_for(notification.id).unwrap().status,
        OutboxStatus::Published
    );
    assert_eq!(pipeline.broker.written("sms_high").len(), 1);

    assert_eq!(pipeline.worker.process_cycle(&token).await, 1);

    assert_eq!(pipeline.provider.calls(), vec![notification.id]);
    assert_eq!(
        pipeline.repository.notification(notification.id).unwrap().status,
        NotificationStatus::Sended
    );
    assert_eq!(
        pipeline.repository.event_for(notification.id).unwrap().status,
        OutboxStatus::Sended
    );
    assert_eq!(pipeline.broker.committed_count("sms_high"), 1);
    assert_eq!(pipeline.broker.unacked_count("sms_high"), 0);

    Ok(())
}

/// Test: A fetch cycle drains high before medium and medium before low
#[tokio::test]
async fn test_fetch_respects_priority_precedence() -> Result<()> {
    let mut config = worker_config();
    config.batch_size = 5;
    let pipeline = Pipeline::with_config(Channel::Email, RecordingProvider::new(), config);

    for priority in [Priority::Low, Priority::Medium, Priority::High] {
        for _ in 0..3 {
            pipeline
                .service
                .create(request(Channel::Email, priority))
                .await?;
        }
    }
    assert_eq!(pipeline.publisher.run_cycle().await?, 9);

    let batch = pipeline.worker.fetch_batch().await;
    let topics: Vec<&str> = batch.iter().map(|(_, d)| d.topic.as_str()).collect();

    assert_eq!(
        topics,
        vec![
            "email_high",
            "email_high",
            "email_high",
            "email_medium",
            "email_medium"
        ]
    );

    Ok(())
}

/// Test: Redelivery of an already delivered message does not call the provider again
#[tokio::test]
async fn test_replayed_message_is_not_resent() -> Result<()> {
    let pipeline = Pipeline::new(Channel::Sms, RecordingProvider::new());
    let token = CancellationToken::new();

    let notification = pipeline
        .service
        .create(request(Channel::Sms, Priority::Medium))
        .await?;
    pipeline.publisher.run_cycle().await?;
    pipeline.worker.process_cycle(&token).await;

    let payload = pipeline.broker.written("sms_medium")[0].clone();
    pipeline
        .broker
        .write_messages(vec![BrokerMessage::new("sms_medium", payload)])
        .await?;

    assert_eq!(pipeline.worker.process_cycle(&token).await, 1);

    assert_eq!(pipeline.provider.call_count(), 1);
    assert_eq!(pipeline.broker.committed_count("sms_medium"), 2);
    assert_eq!(
        pipeline.repository.notification(notification.id).unwrap().status,
        NotificationStatus::Sended
    );

    Ok(())
}

/// Test: Concurrent copies of one message produce a single provider call
#[tokio::test]
async fn test_concurrent_duplicates_send_once() -> Result<()> {
    let pipeline = Pipeline::new(Channel::Push, RecordingProvider::new());
    let token = CancellationToken::new();

    pipeline
        .service
        .create(request(Channel::Push, Priority::Low))
        .await?;
    pipeline.publisher.run_cycle().await?;

    let payload = pipeline.broker.written("push_low")[0].clone();
    let copies = (0..4)
        .map(|_| BrokerMessage::new("push_low", payload.clone()))
        .collect();
    pipeline.broker.write_messages(copies).await?;

    assert_eq!(pipeline.worker.process_cycle(&token).await, 5);

    assert_eq!(pipeline.provider.call_count(), 1);
    assert_eq!(pipeline.broker.committed_count("push_low"), 5);

    Ok(())
}

/// Test: A failed attempt reschedules the event through the publisher
#[tokio::test]
async fn test_failed_attempt_is_retried_via_outbox() -> Result<()> {
    let provider = RecordingProvider::new();
    provider.fail_next(1);
    let pipeline = Pipeline::new(Channel::Sms, provider);
    let token = CancellationToken::new();

    let notification = pipeline
        .service
        .create(request(Channel::Sms, Priority::High))
        .await?;
    pipeline.publisher.run_cycle().await?;
    pipeline.worker.process_cycle(&token).await;

    let event = pipeline.repository.event_for(notification.id).unwrap();
    assert_eq!(event.status, OutboxStatus::Pending);
    assert_eq!(event.retry_count, 1);
    assert_eq!(
        pipeline.repository.notification(notification.id).unwrap().status,
        NotificationStatus::Processing
    );
    assert_eq!(pipeline.broker.committed_count("sms_high"), 0);

    pipeline.publisher.run_cycle().await?;
    pipeline.worker.process_cycle(&token).await;

    assert_eq!(pipeline.provider.call_count(), 2);
    let event = pipeline.repository.event_for(notification.id).unwrap();
    assert_eq!(event.status, OutboxStatus::Sended);
    assert_eq!(event.retry_count, 1);
    assert_eq!(
        pipeline.repository.notification(notification.id).unwrap().status,
        NotificationStatus::Sended
    );

    Ok(())
}

/// Test: Seven consecutive failures leave the event failed
#[tokio::test]
async fn test_retry_ceiling_marks_event_failed() -> Result<()> {
    let pipeline = Pipeline::new(Channel::Sms, RecordingProvider::failing());
    let token = CancellationToken::new();

    let notification = pipeline
        .service
        .create(request(Channel::Sms, Priority::High))
        .await?;

    for _ in 0..7 {
        pipeline.publisher.run_cycle().await?;
        pipeline.worker.process_cycle(&token).await;
    }

    let event = pipeline.repository.event_for(notification.id).unwrap();
    assert_eq!(event.status, OutboxStatus::Failed);
    assert_eq!(event.retry_count, 7);
    assert_eq!(pipeline.provider.call_count(), 7);
    assert_eq!(
        pipeline.repository.notification(notification.id).unwrap().status,
        NotificationStatus::Processing
    );

    assert_eq!(pipeline.publisher.run_cycle().await?, 0);
    pipeline.worker.process_cycle(&token).await;
    assert_eq!(pipeline.provider.call_count(), 7);
    assert_eq!(pipeline.broker.ready_count("sms_high"), 0);

    Ok(())
}

/// Test: An undecodable payload goes to the dead-letter topic and is committed
#[tokio::test]
async fn test_poison_message_is_dead_lettered() -> Result<()> {
    let pipeline = Pipeline::new(Channel::Sms, RecordingProvider::new());
    let token = CancellationToken::new();

    pipeline
        .broker
        .write_messages(vec![BrokerMessage::new("sms_low", b"{not json".to_vec())])
        .await?;

    assert_eq!(pipeline.worker.process_cycle(&token).await, 1);

    let dead = pipeline.broker.written("sms_dlq");
    assert_eq!(dead.len(), 1);
    let dlq: DlqMessage = serde_json::from_slice(&dead[0])?;
    assert_eq!(dlq.source_topic, "sms_low");
    assert_eq!(dlq.original_payload, "{not json");

    assert_eq!(pipeline.broker.committed_count("sms_low"), 1);
    assert_eq!(pipeline.provider.call_count(), 0);

    Ok(())
}

/// Test: Messages without a published outbox row are committed untouched
#[tokio::test]
async fn test_gate_skips_unknown_and_pending_events() -> Result<()> {
    let pipeline = Pipeline::new(Channel::Email, RecordingProvider::new());
    let token = CancellationToken::new();

    let orphan = Notification::new(request(Channel::Email, Priority::High), None, Utc::now());

    let pending = pipeline
        .service
        .create(request(Channel::Email, Priority::High))
        .await?;
    let pending_payload = pipeline
        .repository
        .event_for(pending.id)
        .unwrap()
        .payload;

    pipeline
        .broker
        .write_messages(vec![
            BrokerMessage::new("email_high", serde_json::to_vec(&orphan)?),
            BrokerMessage::new("email_high", pending_payload),
        ])
        .await?;

    assert_eq!(pipeline.worker.process_cycle(&token).await, 2);

    assert_eq!(pipeline.provider.call_count(), 0);
    assert_eq!(pipeline.broker.committed_count("email_high"), 2);
    assert_eq!(
        pipeline.repository.notification(pending.id).unwrap().status,
        NotificationStatus::Pending
    );

    Ok(())
}

/// Test: A claim left behind by a crashed worker is swept and delivered once
#[tokio::test]
async fn test_crashed_claim_is_recovered_by_sweep() -> Result<()> {
    let pipeline = Pipeline::new(Channel::Push, RecordingProvider::new());
    let token = CancellationToken::new();

    let notification = pipeline
        .service
        .create(request(Channel::Push, Priority::Medium))
        .await?;
    pipeline.publisher.run_cycle().await?;

    // The worker claims and marks processing, then dies before sending.
    assert!(
        pipeline
            .repository
            .claim_event_for_delivery(notification.id)
            .await?
    );
    pipeline
        .repository
        .update_notification_status(notification.id, NotificationStatus::Processing)
        .await?;

    // The redelivered copy sees an in-flight claim and is committed unsent.
    pipeline.worker.process_cycle(&token).await;
    assert_eq!(pipeline.provider.call_count(), 0);
    assert_eq!(pipeline.broker.committed_count("push_medium"), 1);
    assert_eq!(
        pipeline.repository.notification(notification.id).unwrap().status,
        NotificationStatus::Processing
    );
    assert_eq!(
        pipeline.repository.event_for(notification.id).unwrap().status,
        OutboxStatus::Delivering
    );

    let sweeper = pipeline.sweeping_publisher(Duration::from_millis(1));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(sweeper.requeue_stale().await?, 1);
    assert_eq!(
        pipeline.repository.event_for(notification.id).unwrap().status,
        OutboxStatus::Pending
    );

    assert_eq!(pipeline.publisher.run_cycle().await?, 1);
    pipeline.worker.process_cycle(&token).await;

    assert_eq!(pipeline.provider.calls(), vec![notification.id]);
    assert_eq!(
        pipeline.repository.notification(notification.id).unwrap().status,
        NotificationStatus::Sended
    );
    let event = pipeline.repository.event_for(notification.id).unwrap();
    assert_eq!(event.status, OutboxStatus::Sended);
    assert_eq!(event.retry_count, 0);

    Ok(())
}

/// Test: A claim whose send already succeeded is settled as sended, not resent
#[tokio::test]
async fn test_sweep_settles_claim_of_delivered_notification() -> Result<()> {
    let pipeline = Pipeline::new(Channel::Push, RecordingProvider::new());
    let token = CancellationToken::new();

    let notification = pipeline
        .service
        .create(request(Channel::Push, Priority::High))
        .await?;
    pipeline.publisher.run_cycle().await?;

    // Crash after the provider call and notification update, before the
    // event row was settled and the message committed.
    pipeline
        .repository
        .claim_event_for_delivery(notification.id)
        .await?;
    pipeline
        .repository
        .update_notification_status(notification.id, NotificationStatus::Sended)
        .await?;

    let sweeper = pipeline.sweeping_publisher(Duration::from_millis(1));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(sweeper.requeue_stale().await?, 1);
    assert_eq!(
        pipeline.repository.event_for(notification.id).unwrap().status,
        OutboxStatus::Sended
    );

    assert_eq!(pipeline.publisher.run_cycle().await?, 0);
    pipeline.worker.process_cycle(&token).await;
    assert_eq!(pipeline.provider.call_count(), 0);
    assert_eq!(pipeline.broker.committed_count("push_high"), 1);

    Ok(())
}

/// Test: A low rate limit spreads provider calls over time without dropping messages
#[tokio::test]
async fn test_rate_limit_paces_deliveries() -> Result<()> {
    let config = WorkerConfig {
        rate_limit: 5,
        ..worker_config()
    };
    let pipeline = Pipeline::with_config(Channel::Sms, RecordingProvider::new(), config);
    let token = CancellationToken::new();

    let requests = (0..10)
        .map(|_| request(Channel::Sms, Priority::Medium))
        .collect();
    pipeline.service.bulk_create(requests).await?;
    assert_eq!(pipeline.publisher.run_cycle().await?, 10);

    let started = Instant::now();
    assert_eq!(pipeline.worker.process_cycle(&token).await, 10);
    let elapsed = started.elapsed();

    // Burst of five, then one permit every 200ms.
    assert!(
        elapsed >= Duration::from_millis(700),
        "ten deliveries at 5/s finished in {elapsed:?}"
    );
    assert_eq!(pipeline.provider.call_count(), 10);
    assert_eq!(pipeline.broker.committed_count("sms_medium"), 10);
    assert_eq!(pipeline.broker.ready_count("sms_medium"), 0);
    assert_eq!(pipeline.broker.unacked_count("sms_medium"), 0);

    Ok(())
}

/// Test: Cancellation lets in-flight deliveries finish, then closes readers
#[tokio::test]
async fn test_shutdown_drains_in_flight_messages() -> Result<()> {
    let pipeline = Arc::new(Pipeline::new(
        Channel::Sms,
        RecordingProvider::slow(Duration::from_millis(200)),
    ));
    let token = CancellationToken::new();

    let notification = pipeline
        .service
        .create(request(Channel::Sms, Priority::High))
        .await?;
    pipeline.publisher.run_cycle().await?;

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        let token = token.clone();
        async move { pipeline.worker.run(token).await }
    });

    sleep(Duration::from_millis(50)).await;
    token.cancel();
    running.await?;

    assert_eq!(pipeline.provider.call_count(), 1);
    assert_eq!(
        pipeline.repository.notification(notification.id).unwrap().status,
        NotificationStatus::Sended
    );
    assert_eq!(pipeline.broker.committed_count("sms_high"), 1);

    Ok(())
}

/// Test: Tasks still running at the drain deadline are aborted and redelivered
#[tokio::test]
async fn test_shutdown_deadline_aborts_slow_deliveries() -> Result<()> {
    let mut config = worker_config();
    config.shutdown_timeout = Duration::from_millis(20);
    let pipeline = Arc::new(Pipeline::with_config(
        Channel::Sms,
        RecordingProvider::slow(Duration::from_secs(5)),
        config,
    ));
    let token = CancellationToken::new();

    let notification = pipeline
        .service
        .create(request(Channel::Sms, Priority::Low))
        .await?;
    pipeline.publisher.run_cycle().await?;

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        let token = token.clone();
        async move { pipeline.worker.run(token).await }
    });

    sleep(Duration::from_millis(50)).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), running).await??;

    assert_eq!(pipeline.broker.committed_count("sms_low"), 0);
    assert_eq!(pipeline.broker.unacked_count("sms_low"), 0);
    assert_eq!(pipeline.broker.ready_count("sms_low"), 1);
    assert_eq!(
        pipeline.repository.event_for(notification.id).unwrap().status,
        OutboxStatus::Published
    );

    Ok(())
}
