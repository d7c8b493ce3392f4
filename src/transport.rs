//! UDP 전송 계층
//!
//! 엔진은 소켓을 직접 만지지 않고 `Outbox`에 데이터그램을 쌓는다.
//! 이벤트 루프가 `Transport::flush`로 한 번에 내보낸다.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::Result;

/// 수신 버퍼 크기 (UDP 최대)
pub const RECV_BUFFER_SIZE: usize = 65535;

/// 송신 대기 데이터그램
#[derive(Debug, Default)]
pub struct Outbox {
    datagrams: Vec<(SocketAddr, Vec<u8>)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 데이터그램 추가
    pub fn send(&mut self, to: SocketAddr, data: Vec<u8>) {
        self.datagrams.push((to, data));
    }

    /// 모두 꺼냄
    pub fn drain(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.datagrams)
    }

    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }
}

/// UDP 소켓 래퍼
#[derive(Debug, Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
}

impl Transport {
    /// 소켓 바인딩
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 데이터그램 1개 수신
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    /// 송신. 실패는 로그만 남김 (UDP는 보장 없음)
    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> bool {
        match self.socket.send_to(data, to).await {
            Ok(_) => {
                trace!("송신 {} bytes → {}", data.len(), to);
                true
            }
            Err(e) => {
                warn!("송신 실패 {}: {}", to, e);
                false
            }
        }
    }

    /// 쌓인 데이터그램 전송. 성공한 (개수, 바이트) 반환
    pub async fn flush(&self, outbox: &mut Outbox) -> (u64, u64) {
        let mut count = 0;
        let mut bytes = 0;
        for (to, data) in outbox.drain() {
            if self.send_to(&data, to).await {
                count += 1;
                bytes += data.len() as u64;
            }
        }
        (count, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_drain() {
        let mut outbox = Outbox::new();
        let to: SocketAddr = "127.0.0.1:9".parse().unwrap();
        outbox.send(to, vec![1, 2, 3]);
        outbox.send(to, vec![]);
        assert_eq!(outbox.len(), 2);

        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn test_loopback_flush() {
        let a = Transport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = Transport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut outbox = Outbox::new();
        outbox.send(b.local_addr().unwrap(), b"ping".to_vec());
        let (count, bytes) = a.flush(&mut outbox).await;
        assert_eq!((count, bytes), (1, 4));

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, from) = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
