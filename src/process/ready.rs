use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Interval between connection attempts
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Resolve once something accepts TCP connections on `127.0.0.1:port`.
/// Never resolves otherwise; bound it with a timeout.
pub async fn wait_for_port(port: u16) {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}
