use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use event_queue::{
    queuecontext, ConsumerConfig, Context, FixedTopic, JsonCodec, Metadata, Producer,
    ProducerConfig, Topic,
};
use event_queue_kafka::kafka_producer::KafkaProducer;
use event_queue_kafka::new_consumer;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

use crate::config::Config;
use crate::smoke::{events, SmokeEvent, SmokeProcessor};

mod config;
mod smoke;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let topic = Topic::new(config.smoke_topic.clone());
    let run_id = Uuid::now_v7();
    info!(%run_id, %topic, events = config.smoke_events, "starting smoke run");

    let transport = KafkaProducer::new(&config.producer)?;
    transport
        .ping(Duration::from_secs(config.smoke_ping_timeout_secs))
        .await?;
    let producer = Producer::new(
        ProducerConfig::<SmokeEvent>::new(Arc::new(JsonCodec), Arc::new(FixedTopic(topic.clone())))
            .with_mode(config.smoke_delivery_mode),
        transport,
    );

    let ctx = queuecontext::with_metadata(
        &Context::background(),
        Metadata::from_iter([("origin", "queue-smoke".to_string()), ("run_id", run_id.to_string())]),
    );
    let mut batch = events(run_id, config.smoke_events);
    producer.process_batch(&ctx, &mut batch).await?;
    producer.close().await?;
    info!("produced smoke events");

    let (ctx, done) = Context::background().with_cancel();
    let ctx = ctx.with_timeout(Duration::from_secs(config.smoke_timeout_secs));
    let processor = Arc::new(SmokeProcessor::new(run_id, config.smoke_events, done));
    let consumer = Arc::new(new_consumer(
        config.consumer.clone(),
        ConsumerConfig::<SmokeEvent>::new(
            vec![topic],
            config.smoke_group_id.clone(),
            Arc::new(JsonCodec),
            processor.clone(),
        ),
    )?);

    let mut runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(&ctx).await })
    };
    let finished = tokio::select! {
        joined = &mut runner => Some(joined),
        _ = shutdown() => None,
    };
    consumer.close().await?;
    match finished {
        Some(joined) => joined??,
        None => runner.await??,
    }

    let seen = processor.seen();
    if seen < config.smoke_events {
        anyhow::bail!("consumed {seen} of {} smoke events", config.smoke_events);
    }
    info!(seen, "smoke run passed");
    Ok(())
}
