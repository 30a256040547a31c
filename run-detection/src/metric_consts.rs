pub const MESSAGES_RECEIVED: &str = "run_detection_messages_received";
pub const MESSAGES_ACKED: &str = "run_detection_messages_acked";
pub const MESSAGES_REQUEUED: &str = "run_detection_messages_requeued";
pub const MESSAGES_REJECTED: &str = "run_detection_messages_rejected";
pub const RECV_ERRORS: &str = "run_detection_recv_errors";
pub const SETTLE_ERRORS: &str = "run_detection_settle_errors";
pub const PROCESSING_TIME: &str = "run_detection_processing_ms";
pub const WORKER_SATURATION: &str = "run_detection_worker_saturation_percent";
