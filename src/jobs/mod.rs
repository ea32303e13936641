pub mod billing;
pub mod delivery;
pub mod metering;

pub const DELIVER_WEBHOOK: &str = "deliver_webhook";
pub const PROCESS_BILLING_EVENT: &str = "process_billing_event";
pub const AGGREGATE_USAGE: &str = "aggregate_usage";
pub const SNAPSHOT_ACTIVE_SEATS: &str = "snapshot_active_seats";
pub const REPORT_USAGE: &str = "report_usage";

/// Enqueue-only: drained by the notification subsystem, not by this service.
pub const SEND_NOTIFICATION: &str = "send_notification";
