// ==== Stream source ====
/// Counter for messages yielded by the source
pub const MESSAGES_RECEIVED: &str = "archive_messages_received_total";

/// Counter for offsets durably committed (mark done)
pub const OFFSETS_COMMITTED: &str = "archive_offsets_committed_total";

/// Counter for topic subscription refreshes, labelled by outcome
pub const TOPIC_REFRESHES: &str = "archive_topic_refreshes_total";

/// Gauge for the number of topics currently subscribed
pub const SUBSCRIBED_TOPICS: &str = "archive_subscribed_topics";

/// Counter for source session (re)connects
pub const SOURCE_CONNECTS: &str = "archive_source_connects_total";

// ==== Pipeline ====
/// Counter for messages archived end to end
pub const MESSAGES_ARCHIVED: &str = "archive_messages_archived_total";

/// Counter for duplicates acknowledged without storing, labelled by identity kind
pub const DUPLICATES_SKIPPED: &str = "archive_duplicates_skipped_total";

/// Counter for server-generated identities (no usable client uuid)
pub const SERVER_IDENTITIES: &str = "archive_server_identities_total";

/// Counter for aborted message cycles, labelled by stage and error class
pub const PROCESSING_FAILURES: &str = "archive_processing_failures_total";

/// Counter for messages acknowledged after a data failure, labelled by stage
pub const MESSAGES_REJECTED: &str = "archive_messages_rejected_total";

/// Histogram for end to end processing time of one message, in seconds
pub const PROCESSING_DURATION: &str = "archive_processing_duration_seconds";

// ==== Store and catalog ====
pub const BUNDLES_STORED: &str = "archive_bundles_stored_total";
pub const BUNDLE_BYTES_STORED: &str = "archive_bundle_bytes_stored_total";
pub const DEEP_DELETED_VERSIONS: &str = "archive_deep_deleted_versions_total";
pub const CATALOG_ROWS_INSERTED: &str = "archive_catalog_rows_inserted_total";
