use std::time::Duration;

/// Transmission and resource parameters for a CoAP endpoint.
///
/// Defaults follow RFC 7252 Section 4.8; the blockwise and observe fields
/// follow RFC 7959 and RFC 7641. All values can be overridden before the
/// endpoint is built.
#[derive(Debug, Clone)]
pub struct CoapConfig {
    /// Initial timeout before a confirmable message is retransmitted.
    pub ack_timeout: Duration,
    /// Upper bound of the random jitter factor applied to `ack_timeout`.
    pub ack_random_factor: f64,
    /// Maximum number of retransmissions for a confirmable message.
    pub max_retransmit: u32,
    /// Maximum number of simultaneous outstanding interactions with a peer.
    pub nstart: u32,
    /// Time an exchange is kept before it is evicted.
    pub exchange_lifetime: Duration,
    /// Time a non-confirmable exchange is kept before it expires.
    pub non_lifetime: Duration,
    /// Payloads larger than this are transferred blockwise.
    pub max_message_size: usize,
    /// Block size used when fragmenting payloads. Must be a power of two
    /// between 16 and 1024.
    pub preferred_block_size: usize,
    /// Upper bound on the size of a blockwise-reassembled body.
    pub max_resource_body_size: usize,
    /// Interval after which an observe notification is promoted to
    /// confirmable to verify the observer is still reachable.
    pub notification_check_interval: Duration,
    /// Notification count after which a notification is promoted to
    /// confirmable.
    pub notification_check_interval_count: u32,
    /// Backoff applied before a client re-registers an observation.
    pub notification_reregistration_backoff: Duration,
    /// Length in bytes of generated tokens (at most 8).
    pub token_size_limit: usize,
    /// Receiver threads of the network stage (connector hint).
    pub network_stage_receiver_thread_count: usize,
    /// Sender threads of the network stage (connector hint).
    pub network_stage_sender_thread_count: usize,
    /// Socket receive buffer hint for the UDP connector.
    pub udp_connector_receive_buffer: usize,
    /// Socket send buffer hint for the UDP connector.
    pub udp_connector_send_buffer: usize,
    /// Size of the datagram receive buffer of the UDP connector.
    pub udp_connector_datagram_size: usize,
}

impl Default for CoapConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            exchange_lifetime: Duration::from_secs(247),
            non_lifetime: Duration::from_secs(145),
            max_message_size: 1024,
            preferred_block_size: 512,
            max_resource_body_size: 8192,
            notification_check_interval: Duration::from_secs(24 * 60 * 60),
            notification_check_interval_count: 100,
            notification_reregistration_backoff: Duration::from_secs(2),
            token_size_limit: 8,
            network_stage_receiver_thread_count: 1,
            network_stage_sender_thread_count: 1,
            udp_connector_receive_buffer: 0,
            udp_connector_send_buffer: 0,
            udp_connector_datagram_size: 2048,
        }
    }
}

impl CoapConfig {
    /// Largest time from the first transmission of a confirmable message to
    /// the moment the last retransmission would fire.
    pub fn max_transmit_wait(&self) -> Duration {
        let factor = (2u32.pow(self.max_retransmit + 1) - 1) as f64 * self.ack_random_factor;
        self.ack_timeout.mul_f64(factor)
    }
}
