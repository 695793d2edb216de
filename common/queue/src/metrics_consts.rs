// ==== Producer metrics ====
/// Counter for records acknowledged by the broker (with topic label)
pub const PRODUCER_RECORDS_PRODUCED: &str = "queue_producer_records_produced_total";

/// Counter for records the transport refused or failed to deliver (with topic label)
pub const PRODUCER_RECORDS_FAILED: &str = "queue_producer_records_failed_total";

/// Counter for events dropped by an async producer before reaching the transport
pub const PRODUCER_RECORDS_DROPPED: &str = "queue_producer_records_dropped_total";

// ==== Consumer metrics ====
/// Counter for batches handed to the processor and committed
pub const CONSUMER_BATCHES_PROCESSED: &str = "queue_consumer_batches_processed_total";

/// Histogram for batch size (number of events per processor call)
pub const CONSUMER_BATCH_SIZE: &str = "queue_consumer_batch_size_events";

/// Counter for records that could not be decoded (with topic label)
pub const CONSUMER_DECODE_ERRORS: &str = "queue_consumer_decode_errors_total";

/// Counter for processor calls that returned an error
pub const CONSUMER_PROCESSING_FAILURES: &str = "queue_consumer_processing_failures_total";

/// Counter for failed commits
pub const CONSUMER_COMMIT_FAILURES: &str = "queue_consumer_commit_failures_total";

/// Counter for poll errors (with transient label)
pub const CONSUMER_POLL_ERRORS: &str = "queue_consumer_poll_errors_total";
