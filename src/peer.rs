//! 피어 엔티티와 연결 상태
//!
//! 상태 전이:
//! - `Idle`/`Resolving` → `Offered` (우리가 시작, 핸드쉐이크 키 전송)
//! - 미지 주소의 키 수신 → `Accepted` (상대가 시작, 확인 메시지 응답)
//! - `Offered`/`Accepted` → `Established` (첫 복호화 성공)
//!
//! 세션 키는 `Offered`/`Accepted`/`Established`에서만 존재한다.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::crypto::{PublicKeyBytes, SessionCipher};
use crate::media::{MediaTransfer, OutboundMedia};
use crate::message::MediaCode;
use crate::{Error, Result};

/// 연결 시도 결과 대기자 (사용한 시도 횟수)
pub type Waiter = oneshot::Sender<Result<u32>>;

/// 연결 상태
pub enum Link {
    /// 세션 없음 (공개키는 알 수도 있음)
    Idle,

    /// 트래커에 공개키/주소 조회 중
    Resolving {
        deadline: Instant,
        /// announce를 보낸 트래커 수
        asked: usize,
        /// unknown 응답 수
        unknown: usize,
    },

    /// 임시 공개키를 보내고 확인 대기 중
    Offered {
        local_public: PublicKeyBytes,
        cipher: SessionCipher,
        next_attempt: Instant,
    },

    /// 상대 키를 수락, 상대의 첫 메시지 대기 중
    Accepted {
        remote_public: PublicKeyBytes,
        cipher: SessionCipher,
    },

    Established { cipher: SessionCipher },
}

impl Link {
    pub fn name(&self) -> &'static str {
        match self {
            Link::Idle => "idle",
            Link::Resolving { .. } => "resolving",
            Link::Offered { .. } => "offered",
            Link::Accepted { .. } => "accepted",
            Link::Established { .. } => "established",
        }
    }
}

/// 원격 피어
pub struct Peer {
    pub addr: SocketAddr,

    /// 장기 공개키 (모를 수 있음)
    pub public_key: Option<PublicKeyBytes>,

    pub link: Link,

    /// 남은 시도 횟수 (0이면 포기)
    pub quality: u32,

    /// 마지막으로 유효한 데이터그램을 받은 시간
    pub last_access: Instant,

    /// 생존 확인 대상 여부
    pub keep_alive: bool,

    /// 상대가 연결을 시작했는지
    pub is_sender: bool,

    /// 다음 페이로드 송신 가능 시각 (상대측 쿨다운 준수)
    pub next_send: Instant,

    waiters: Vec<Waiter>,
    queued: VecDeque<Vec<u8>>,

    /// 진행 중인 미디어 전송 (피어당 1개)
    pub media: Option<MediaTransfer>,

    /// 대기 중인 송신 미디어 (FIFO)
    pub media_queue: VecDeque<OutboundMedia>,

    /// 마지막 수신 전송 결과 (재전송된 종료 마커 응답용)
    pub last_media_result: Option<MediaCode>,
}

impl Peer {
    pub fn new(
        addr: SocketAddr,
        public_key: Option<PublicKeyBytes>,
        max_trial: u32,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            public_key,
            link: Link::Idle,
            quality: max_trial,
            last_access: now,
            keep_alive: false,
            is_sender: false,
            next_send: now,
            waiters: Vec::new(),
            queued: VecDeque::new(),
            media: None,
            media_queue: VecDeque::new(),
            last_media_result: None,
        }
    }

    /// 현재 세션 암호화기
    pub fn cipher(&self) -> Option<&SessionCipher> {
        match &self.link {
            Link::Offered { cipher, .. }
            | Link::Accepted { cipher, .. }
            | Link::Established { cipher } => Some(cipher),
            Link::Idle | Link::Resolving { .. } => None,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.link, Link::Established { .. })
    }

    /// 상대에게 페이로드를 보낼 수 있는 상태인지
    pub fn can_send(&self) -> bool {
        matches!(self.link, Link::Accepted { .. } | Link::Established { .. })
    }

    pub fn media_active(&self) -> bool {
        self.media.is_some()
    }

    /// 평문 암호화 (세션 없으면 None)
    pub fn seal(&self, plain: &[u8]) -> Option<Vec<u8>> {
        self.cipher()?.encrypt(plain).ok()
    }

    /// 세션 확립. 사용한 시도 횟수 반환
    pub fn promote(&mut self, max_trial: u32) -> u32 {
        let attempts = max_trial.saturating_sub(self.quality).max(1);
        self.link = match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Offered { cipher, .. }
            | Link::Accepted { cipher, .. }
            | Link::Established { cipher } => Link::Established { cipher },
            other => other,
        };
        self.quality = max_trial;
        self.keep_alive = true;
        attempts
    }

    /// 결함 기록. quality가 0이 되면 true
    pub fn fault(&mut self) -> bool {
        self.quality = self.quality.saturating_sub(1);
        self.quality == 0
    }

    pub fn add_waiter(&mut self, waiter: Waiter) {
        self.waiters.push(waiter);
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// 대기자에게 성공 통지
    pub fn resolve_connected(&mut self, attempts: u32) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(attempts));
        }
    }

    /// 대기자에게 실패 통지
    pub fn resolve_failed(&mut self, attempts: u32) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::ConnectFailed { attempts }));
        }
    }

    /// 세션 확립 후 보낼 평문 페이로드
    pub fn queue(&mut self, payload: Vec<u8>) {
        self.queued.push_back(payload);
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// 송신 가능하면 대기 페이로드 1개를 꺼냄
    pub fn next_queued(&mut self, now: Instant) -> Option<Vec<u8>> {
        if !self.can_send() || now < self.next_send {
            return None;
        }
        self.queued.pop_front()
    }

    pub fn clear_queue(&mut self) -> usize {
        let dropped = self.queued.len();
        self.queued.clear();
        dropped
    }
}

/// 애플리케이션에 노출하는 피어 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub public_key: Option<PublicKeyBytes>,
    pub is_sender: bool,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            addr: peer.addr,
            public_key: peer.public_key,
            is_sender: peer.is_sender,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{offer_session, KeyPair};

    fn addr() -> SocketAddr {
        "198.51.100.7:40002".parse().unwrap()
    }

    fn offered(peer: &mut Peer, now: Instant) {
        let remote = KeyPair::generate();
        let (local_public, cipher) = offer_session(&remote.public_key_bytes()).unwrap();
        peer.link = Link::Offered {
            local_public,
            cipher,
            next_attempt: now,
        };
    }

    #[test]
    fn test_promote_counts_attempts() {
        let now = Instant::now();
        let mut peer = Peer::new(addr(), None, 5, now);
        offered(&mut peer, now);
        peer.quality = 3;

        assert!(peer.cipher().is_some());
        assert!(!peer.can_send());
        assert_eq!(peer.promote(5), 2);
        assert!(peer.is_established());
        assert_eq!(peer.quality, 5);
        assert!(peer.keep_alive);
    }

    #[test]
    fn test_promote_first_attempt() {
        let now = Instant::now();
        let mut peer = Peer::new(addr(), None, 5, now);
        offered(&mut peer, now);
        assert_eq!(peer.promote(5), 1);
    }

    #[test]
    fn test_fault_reaches_zero() {
        let mut peer = Peer::new(addr(), None, 3, Instant::now());
        assert!(!peer.fault());
        assert!(!peer.fault());
        assert!(peer.fault());
        assert!(peer.fault());
    }

    #[test]
    fn test_waiters_resolved_once() {
        let mut peer = Peer::new(addr(), None, 5, Instant::now());
        let (tx, mut rx) = oneshot::channel();
        peer.add_waiter(tx);

        peer.resolve_failed(5);
        peer.resolve_connected(1);

        assert!(matches!(
            rx.try_recv(),
            Ok(Err(Error::ConnectFailed { attempts: 5 }))
        ));
        assert!(!peer.has_waiters());
    }

    #[test]
    fn test_queue_waits_for_session() {
        let now = Instant::now();
        let mut peer = Peer::new(addr(), None, 5, now);
        peer.queue(b"[1]".to_vec());
        assert_eq!(peer.next_queued(now), None);

        offered(&mut peer, now);
        peer.promote(5);
        peer.next_send = now + std::time::Duration::from_millis(20);
        assert_eq!(peer.next_queued(now), None);
        assert_eq!(
            peer.next_queued(now + std::time::Duration::from_millis(20)),
            Some(b"[1]".to_vec())
        );
        assert_eq!(peer.queued_len(), 0);
    }
}
