use metrics::{counter, gauge};
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Statistics, TopicPartitionList};
use tracing::{debug, info, warn};

/// Which side of the queue a client serves. Decides which librdkafka
/// statistics are exported and how they are labelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientRole {
    Producer,
    Consumer { group_id: String },
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Producer => "producer",
            ClientRole::Consumer { .. } => "consumer",
        }
    }
}

/// Client context for the Kafka producer and consumer. Exports librdkafka
/// statistics as metrics and logs group rebalances.
#[derive(Clone, Debug)]
pub struct KafkaContext {
    role: ClientRole,
}

impl KafkaContext {
    pub fn producer() -> Self {
        KafkaContext {
            role: ClientRole::Producer,
        }
    }

    pub fn consumer(group_id: &str) -> Self {
        KafkaContext {
            role: ClientRole::Consumer {
                group_id: group_id.to_string(),
            },
        }
    }

    pub fn role(&self) -> &ClientRole {
        &self.role
    }

    fn producer_stats(stats: &Statistics) {
        gauge!("queue_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("queue_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("queue_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("queue_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (topic, stats) in &stats.topics {
            gauge!(
                "queue_kafka_produce_avg_batch_size_bytes",
                "topic" => topic.clone()
            )
            .set(stats.batchsize.avg as f64);
            gauge!(
                "queue_kafka_produce_avg_batch_size_events",
                "topic" => topic.clone()
            )
            .set(stats.batchcnt.avg as f64);
        }
    }

    fn consumer_stats(stats: &Statistics, group_id: &str) {
        for (topic, stats) in &stats.topics {
            for (partition, stats) in &stats.partitions {
                // -1 is librdkafka's internal unassigned partition, a negative
                // lag means it is not known yet
                if *partition < 0 || stats.consumer_lag < 0 {
                    continue;
                }
                gauge!(
                    "queue_kafka_consumer_lag",
                    "topic" => topic.clone(),
                    "partition" => partition.to_string(),
                    "consumergroup" => group_id.to_string()
                )
                .set(stats.consumer_lag as f64);
            }
        }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, stats: Statistics) {
        let client = self.role.as_str();
        gauge!("queue_kafka_callback_queue_depth", "client" => client).set(stats.replyq as f64);

        match &self.role {
            ClientRole::Producer => Self::producer_stats(&stats),
            ClientRole::Consumer { group_id } => Self::consumer_stats(&stats, group_id),
        }

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            if let Some(rtt) = stats.rtt {
                gauge!(
                    "queue_kafka_rtt_latency_us",
                    "quantile" => "p50",
                    "broker" => id_string.clone(),
                    "client" => client
                )
                .set(rtt.p50 as f64);
                gauge!(
                    "queue_kafka_rtt_latency_us",
                    "quantile" => "p99",
                    "broker" => id_string.clone(),
                    "client" => client
                )
                .set(rtt.p99 as f64);
            }

            gauge!(
                "queue_kafka_broker_requests_pending",
                "broker" => id_string.clone(),
                "client" => client
            )
            .set(stats.outbuf_cnt as f64);
            counter!(
                "queue_kafka_broker_tx_errors_total",
                "broker" => id_string.clone(),
                "client" => client
            )
            .absolute(stats.txerrs);
            counter!(
                "queue_kafka_broker_rx_errors_total",
                "broker" => id_string,
                "client" => client
            )
            .absolute(stats.rxerrs);
        }
    }
}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "partitions revoked");
            }
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "partitions assigned");
            }
            Rebalance::Error(err) => {
                warn!(error = %err, "rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!(partitions = offsets.count(), "committed offsets"),
            Err(e) => warn!(error = %e, "failed to commit offsets"),
        }
    }
}
