use iroh_metrics::{Counter, Gauge, MetricsGroup};

/// Metrics for the bitswap client.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "bitswap")]
pub struct Metrics {
    /// Number of items in the wantlist.
    pub wantlist_total: Gauge,
    /// Number of want and cancel batches handed to the peer handler.
    pub want_batches: Counter,

    /// Number of message queues started.
    pub message_queues_started: Counter,
    /// Number of message queues shut down.
    pub message_queues_stopped: Counter,
    /// Number of message senders opened.
    pub senders_opened: Counter,
    /// Number of messages sent to peers.
    pub messages_sent: Counter,
    /// Number of failed attempts to send a message.
    pub send_errors: Counter,
    /// Number of messages dropped after running out of retries.
    pub messages_dropped: Counter,

    /// Number of peers tagged by sessions.
    pub session_peers_tagged: Counter,
    /// Number of times a session peer was promoted to the optimized set.
    pub session_peers_promoted: Counter,
    /// Number of providers found through provider lookups.
    pub providers_found: Counter,
}
