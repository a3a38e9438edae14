//! SNTP time acquisition
//!
//! One-shot clock sync for gateways whose RTC starts unset. The helper owns
//! no references back into the gateway: `sync_task` polls until a server
//! answers and delivers the timestamp through the channel it was given.

use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Seconds between the NTP era (1900) and the Unix epoch (1970)
const NTP_DELTA: u64 = 2_208_988_800;

/// Retry cadence while no server answers
const RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Reply wait per query
const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Query `host` once on the standard NTP port. Returns Unix seconds, or
/// `None` on timeout, a LAN error, or a server returning the zero timestamp.
pub async fn poll(host: &str) -> Option<u64> {
    poll_addr((host, 123)).await
}

/// Query an explicit server address once
pub async fn poll_addr(addr: impl ToSocketAddrs) -> Option<u64> {
    let sock = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    sock.connect(addr).await.ok()?;

    let mut query = [0u8; 48];
    query[0] = 0x1B;
    sock.send(&query).await.ok()?;

    let mut resp = [0u8; 48];
    let n = tokio::time::timeout(QUERY_TIMEOUT, sock.recv(&mut resp))
        .await
        .ok()?
        .ok()?;
    if n < 44 {
        return None;
    }
    let secs = u32::from_be_bytes([resp[40], resp[41], resp[42], resp[43]]) as u64;
    if secs == 0 {
        return None;
    }
    secs.checked_sub(NTP_DELTA)
}

/// Poll until a timestamp arrives, then deliver it and finish. The `gate`
/// callback defers queries while the broker link (and thus the LAN) is down.
pub async fn sync_task(
    host: String,
    tx: mpsc::Sender<u64>,
    gate: impl Fn() -> bool + Send + 'static,
) {
    loop {
        if gate() {
            if let Some(now) = poll(&host).await {
                info!(host = %host, epoch = now, "time synchronized");
                let _ = tx.send(now).await;
                return;
            }
            debug!(host = %host, "time sync attempt failed");
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answer one SNTP query with `secs` in the transmit-timestamp field
    async fn one_shot_server(secs: u32) -> std::net::SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 48];
            let (_, from) = sock.recv_from(&mut buf).await.unwrap();
            let mut resp = [0u8; 48];
            resp[40..44].copy_from_slice(&secs.to_be_bytes());
            sock.send_to(&resp, from).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn poll_converts_ntp_era_to_unix() {
        // 2023-01-01T00:00:00Z in NTP seconds
        let ntp_secs = (1_672_531_200u64 + NTP_DELTA) as u32;
        let addr = one_shot_server(ntp_secs).await;
        assert_eq!(poll_addr(addr).await, Some(1_672_531_200));
    }

    #[tokio::test]
    async fn zero_timestamp_is_rejected() {
        let addr = one_shot_server(0).await;
        assert_eq!(poll_addr(addr).await, None);
    }

    #[tokio::test]
    async fn silence_times_out() {
        // Bound but never answered
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        assert_eq!(poll_addr(addr).await, None);
    }
}
