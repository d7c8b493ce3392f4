//! 원격 엔드포인트 레지스트리 + 생존 확인
//!
//! 주소 하나는 피어이거나 트래커이다. 종류는 `EndpointKind`로 명시적으로 구분한다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::peer::Peer;
use crate::tracker::Tracker;

/// 엔드포인트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Peer,
    Tracker,
}

/// 등록된 원격 엔드포인트
pub enum Endpoint {
    Peer(Peer),
    Tracker(Tracker),
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Peer(_) => EndpointKind::Peer,
            Endpoint::Tracker(_) => EndpointKind::Tracker,
        }
    }
}

/// 생존 확인 결과
pub struct Sweep {
    /// 레지스트리에서 빠진 피어 (상대가 시작한 연결)
    pub removed: Vec<Peer>,
    /// 폴링만 멈춘 피어 주소 (우리가 시작한 연결)
    pub stale: Vec<SocketAddr>,
}

/// 주소 → 엔드포인트
#[derive(Default)]
pub struct Registry {
    endpoints: HashMap<SocketAddr, Endpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind_of(&self, addr: &SocketAddr) -> Option<EndpointKind> {
        self.endpoints.get(addr).map(Endpoint::kind)
    }

    pub fn insert_peer(&mut self, peer: Peer) {
        self.endpoints.insert(peer.addr, Endpoint::Peer(peer));
    }

    pub fn insert_tracker(&mut self, tracker: Tracker) {
        self.endpoints.insert(tracker.addr, Endpoint::Tracker(tracker));
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<&Peer> {
        match self.endpoints.get(addr) {
            Some(Endpoint::Peer(peer)) => Some(peer),
            _ => None,
        }
    }

    pub fn peer_mut(&mut self, addr: &SocketAddr) -> Option<&mut Peer> {
        match self.endpoints.get_mut(addr) {
            Some(Endpoint::Peer(peer)) => Some(peer),
            _ => None,
        }
    }

    pub fn tracker(&self, addr: &SocketAddr) -> Option<&Tracker> {
        match self.endpoints.get(addr) {
            Some(Endpoint::Tracker(tracker)) => Some(tracker),
            _ => None,
        }
    }

    /// 피어를 꺼냄 (처리 후 `insert_peer`로 되돌림)
    pub fn take_peer(&mut self, addr: &SocketAddr) -> Option<Peer> {
        if self.kind_of(addr) != Some(EndpointKind::Peer) {
            return None;
        }
        match self.endpoints.remove(addr) {
            Some(Endpoint::Peer(peer)) => Some(peer),
            _ => None,
        }
    }

    pub fn take_tracker(&mut self, addr: &SocketAddr) -> Option<Tracker> {
        if self.kind_of(addr) != Some(EndpointKind::Tracker) {
            return None;
        }
        match self.endpoints.remove(addr) {
            Some(Endpoint::Tracker(tracker)) => Some(tracker),
            _ => None,
        }
    }

    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.addresses_of(EndpointKind::Peer)
    }

    pub fn tracker_addresses(&self) -> Vec<SocketAddr> {
        self.addresses_of(EndpointKind::Tracker)
    }

    fn addresses_of(&self, kind: EndpointKind) -> Vec<SocketAddr> {
        self.endpoints
            .iter()
            .filter(|(_, e)| e.kind() == kind)
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// welcome을 받은 트래커 주소
    pub fn connected_trackers(&self) -> Vec<SocketAddr> {
        self.endpoints
            .values()
            .filter_map(|e| match e {
                Endpoint::Tracker(t) if t.connected => Some(t.addr),
                _ => None,
            })
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.addresses_of(EndpointKind::Peer).len()
    }

    pub fn tracker_count(&self) -> usize {
        self.addresses_of(EndpointKind::Tracker).len()
    }

    /// 생존 확인: 오래 조용한 폴링 대상은 폴링에서 뺀다.
    /// 상대가 시작한 연결은 레지스트리에서도 제거하고,
    /// 우리가 시작한 연결은 주소만 돌려준다 (재핸드쉐이크 대상)
    pub fn sweep(&mut self, now: Instant, limit: Duration) -> Sweep {
        let mut expired = Vec::new();
        let mut stale = Vec::new();

        for endpoint in self.endpoints.values_mut() {
            let Endpoint::Peer(peer) = endpoint else {
                continue;
            };
            if !peer.keep_alive || now.saturating_duration_since(peer.last_access) <= limit {
                continue;
            }
            peer.keep_alive = false;
            debug!("폴링 중지: {} ({})", peer.addr, peer.link.name());
            if peer.is_sender {
                expired.push(peer.addr);
            } else {
                stale.push(peer.addr);
            }
        }

        Sweep {
            removed: expired
                .into_iter()
                .filter_map(|addr| self.take_peer(&addr))
                .collect(),
            stale,
        }
    }
}
