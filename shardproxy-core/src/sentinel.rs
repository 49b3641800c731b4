//! The sentinel client (§4.I): a single connection to a configured sentinel
//! instance that subscribes to master-switch/redirect channels and drives
//! backend address swaps on topology change.

use std::time::{Duration, Instant};

use tracing::{info, warn};

/// State machine exactly as enumerated in §4.I; an explicit enum rather than
/// booleans, matching the teacher's preference for explicit state enums
/// (§9 design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelState {
    Disconnected,
    SendInfo,
    AckInfo,
    SubscribeSwitch,
    AckSwitch,
    SubscribeRedirect,
    AckRedirect,
    Steady,
}

/// A parsed `+switch-master`/`+redirect-to-master` notification:
/// `<pool>-<name> <old-ip> <old-port> <new-ip> <new-port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchNotification {
    pub pool: String,
    pub backend_name: String,
    pub old_addr: String,
    pub new_addr: String,
}

pub fn parse_switch_message(payload: &str) -> Option<SwitchNotification> {
    let mut parts = payload.split_whitespace();
    let pool_shard = parts.next()?;
    let old_ip = parts.next()?;
    let old_port = parts.next()?;
    let new_ip = parts.next()?;
    let new_port = parts.next()?;
    let (pool, backend_name) = pool_shard.split_once('-')?;
    Some(SwitchNotification {
        pool: pool.to_string(),
        backend_name: backend_name.to_string(),
        old_addr: format!("{old_ip}:{old_port}"),
        new_addr: format!("{new_ip}:{new_port}"),
    })
}

pub struct SentinelClient {
    pub state: SentinelState,
    pub reconnect_interval: Duration,
    pub next_reconnect_at: Option<Instant>,
}

impl SentinelClient {
    pub fn new(reconnect_interval: Duration) -> Self {
        SentinelClient {
            state: SentinelState::Disconnected,
            reconnect_interval,
            next_reconnect_at: None,
        }
    }

    /// The three commands sent in order immediately after connect (§6).
    pub fn handshake_commands() -> [Vec<u8>; 3] {
        [
            crate::parser::resp::encode_multibulk("info", [b"sentinel".as_ref()]),
            crate::parser::resp::encode_multibulk("info", [b"replication".as_ref()]),
            crate::parser::resp::encode_multibulk(
                "subscribe",
                [b"+switch-master".as_ref(), b"+redirect-to-master".as_ref()],
            ),
        ]
    }

    pub fn on_connected(&mut self) {
        self.state = SentinelState::SendInfo;
    }

    pub fn advance(&mut self, ack: SentinelState) {
        self.state = ack;
        if self.state == SentinelState::Steady {
            info!("sentinel client reached steady state");
        }
    }

    pub fn on_disconnected(&mut self, now: Instant) {
        warn!("sentinel connection lost, scheduling reconnect");
        self.state = SentinelState::Disconnected;
        self.next_reconnect_at = Some(now + self.reconnect_interval);
    }

    pub fn should_reconnect(&self, now: Instant) -> bool {
        self.state == SentinelState::Disconnected
            && self.next_reconnect_at.map(|t| now >= t).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_switch_master_payload() {
        let msg = parse_switch_message("pool1-shard1 10.0.0.1 6379 10.0.0.2 6379").unwrap();
        assert_eq!(msg.pool, "pool1");
        assert_eq!(msg.backend_name, "shard1");
        assert_eq!(msg.old_addr, "10.0.0.1:6379");
        assert_eq!(msg.new_addr, "10.0.0.2:6379");
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(parse_switch_message("garbage").is_none());
    }

    #[test]
    fn reconnect_timer_fires_after_interval_elapses() {
        let mut client = SentinelClient::new(Duration::from_millis(100));
        let now = Instant::now();
        client.on_disconnected(now);
        assert!(!client.should_reconnect(now));
        assert!(client.should_reconnect(now + Duration::from_millis(150)));
    }

    #[test]
    fn state_machine_reaches_steady() {
        let mut client = SentinelClient::new(Duration::from_secs(1));
        client.on_connected();
        assert_eq!(client.state, SentinelState::SendInfo);
        client.advance(SentinelState::AckInfo);
        client.advance(SentinelState::SubscribeSwitch);
        client.advance(SentinelState::AckSwitch);
        client.advance(SentinelState::SubscribeRedirect);
        client.advance(SentinelState::AckRedirect);
        client.advance(SentinelState::Steady);
        assert_eq!(client.state, SentinelState::Steady);
    }
}
