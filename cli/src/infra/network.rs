//! Network infrastructure: implements `NetworkProbe` with a tokio TCP connect.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::application::ports::{NetworkProbe, TcpProbe};

/// How long to wait for the SSH identification line after connecting.
const BANNER_WAIT: Duration = Duration::from_secs(2);

pub struct TokioNetworkProbe;

#[async_trait]
impl NetworkProbe for TokioNetworkProbe {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpProbe, String> {
        let started = Instant::now();
        let mut stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("no answer within {}s", timeout.as_secs())),
        };
        let latency = started.elapsed();

        let mut buf = [0u8; 256];
        let banner = match tokio::time::timeout(BANNER_WAIT, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => first_line(&buf[..n]),
            _ => None,
        };
        Ok(TcpProbe { latency, banner })
    }
}

fn first_line(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let line = text.lines().next()?.trim();
    (!line.is_empty()).then(|| line.to_string())
}
