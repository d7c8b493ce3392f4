//! 트래커 랑데부 프로토콜 (노드측)
//!
//! - 시작 시 트래커마다 임시 공개키를 1초 간격으로 최대 MAX_TRIAL회 전송
//! - `welcome` 수신: 외부 주소 기록, `setPub` 응답, keep-alive 시작
//! - keep-alive에 대한 `welcome`이 끊기면 트래커가 세션을 잊은 것으로 보고 재핸드쉐이크
//! - `announce` → `sendpub`로 대상 피어의 주소/공개키를 받아 직접 핸드쉐이크
//! - `sendrand`: 홀펀칭 보조 디코이 전송
//! - `seeder`/`seeding`/`unseeding`: 계정별 시더 목록 갱신
//!
//! 트래커는 N개의 임시 키를 미리 만들어 두고 시도 i에서 키 i를 보낸다.
//! 트래커측은 상태 없이 마지막으로 받은 키로 응답하므로, 복호화는 모든 키로
//! 시도하고 성공한 키를 활성(0번)으로 옮긴다.

use std::net::SocketAddr;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crypto::{decoy, offer_session, PublicKeyBytes, SessionCipher};
use crate::node::{Node, NodeEvent};
use crate::peer::Link;
use crate::message::{TrackerCommand, TrackerRequest};

/// 랑데부 트래커
pub struct Tracker {
    pub addr: SocketAddr,

    /// 트래커 장기 공개키
    pub public_key: PublicKeyBytes,

    /// (보낼 임시 공개키, 세션) × MAX_TRIAL. 0번이 활성
    keys: Vec<(PublicKeyBytes, SessionCipher)>,

    /// 이번 라운드에 보낸 키 수
    attempt: u32,
    next_attempt: Instant,

    pub connected: bool,
    next_keep_alive: Instant,

    pub last_access: Instant,
}

fn generate_keys(
    public_key: &PublicKeyBytes,
    count: u32,
) -> Option<Vec<(PublicKeyBytes, SessionCipher)>> {
    (0..count.max(1)).map(|_| offer_session(public_key)).collect()
}

impl Tracker {
    /// 트래커 공개키가 키 교환에 쓸 수 없으면 None
    pub fn new(
        addr: SocketAddr,
        public_key: PublicKeyBytes,
        max_trial: u32,
        now: Instant,
    ) -> Option<Self> {
        Some(Self {
            addr,
            public_key,
            keys: generate_keys(&public_key, max_trial)?,
            attempt: 0,
            next_attempt: now,
            connected: false,
            next_keep_alive: now,
            last_access: now,
        })
    }

    /// 시도 i에서 보낼 임시 공개키
    pub fn handshake_key(&self, attempt: u32) -> Option<PublicKeyBytes> {
        self.keys.get(attempt as usize).map(|(key, _)| *key)
    }

    /// 활성 세션으로 암호화
    pub fn seal(&self, plain: &[u8]) -> Option<Vec<u8>> {
        self.keys.first()?.1.encrypt(plain).ok()
    }

    /// 모든 키로 복호화 시도, 성공한 키를 활성으로
    pub fn open(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        for index in 0..self.keys.len() {
            if let Ok(plain) = self.keys[index].1.decrypt(data) {
                if index != 0 {
                    self.keys.swap(0, index);
                }
                return Some(plain);
            }
        }
        None
    }

    /// 새 키로 다음 라운드 준비
    fn restart(&mut self, max_trial: u32, at: Instant) {
        match generate_keys(&self.public_key, max_trial) {
            Some(keys) => self.keys = keys,
            None => warn!("트래커 {} 키 재생성 실패, 이전 키 사용", self.addr),
        }
        self.attempt = 0;
        self.next_attempt = at;
        self.connected = false;
    }
}

impl Node {
    /// 트래커 타이머: 핸드쉐이크 재시도 또는 keep-alive
    ///
    /// 트래커는 keep-alive마다 `welcome`으로 응답한다. `last_access_limit` 동안
    /// 아무것도 오지 않으면 트래커가 세션을 잊은 것으로 보고 새 키로 다시 시작한다.
    pub(crate) fn tick_tracker(&mut self, tracker: &mut Tracker, now: Instant) {
        if tracker.connected {
            let silent = now.saturating_duration_since(tracker.last_access);
            if silent <= self.config.last_access_limit {
                if now >= tracker.next_keep_alive {
                    self.emit(tracker.addr, Vec::new());
                    tracker.next_keep_alive = now + self.config.keep_alive_interval;
                }
                return;
            }

            warn!("트래커 {} {:?} 동안 응답 없음, 다시 핸드쉐이크", tracker.addr, silent);
            self.events.push(NodeEvent::TrackerFailure {
                tracker: tracker.addr,
                reason: format!("{:?} 동안 keep-alive 응답 없음", silent),
            });
            tracker.restart(self.config.max_trial, now);
        }

        if now < tracker.next_attempt {
            return;
        }

        match tracker.handshake_key(tracker.attempt) {
            Some(key) if tracker.attempt < self.config.max_trial => {
                tracker.attempt += 1;
                tracker.next_attempt = now + self.config.handshake_interval;
                debug!(
                    "트래커 핸드쉐이크 {} ({}/{})",
                    tracker.addr, tracker.attempt, self.config.max_trial
                );
                self.emit(tracker.addr, key.to_vec());
            }
            _ => {
                warn!(
                    "트래커 {} 응답 없음: {}회 시도, {:?} 후 재시도",
                    tracker.addr, tracker.attempt, self.config.poll_interval
                );
                self.events.push(NodeEvent::TrackerFailure {
                    tracker: tracker.addr,
                    reason: format!("{}회 핸드쉐이크에 welcome 없음", tracker.attempt),
                });
                tracker.restart(self.config.max_trial, now + self.config.poll_interval);
            }
        }
    }

    /// 트래커에서 온 데이터그램
    pub(crate) fn handle_tracker_datagram(
        &mut self,
        tracker: &mut Tracker,
        data: &[u8],
        now: Instant,
    ) {
        if data.is_empty() {
            return;
        }

        let Some(plain) = tracker.open(data) else {
            debug!("트래커 {} 복호화 실패, 무시", tracker.addr);
            return;
        };
        tracker.last_access = now;

        let command = serde_json::from_slice::<Value>(&plain)
            .ok()
            .and_then(|value| TrackerCommand::parse(&value));
        match command {
            Some(command) => self.handle_tracker_command(tracker, command, now),
            None => warn!("트래커 {} 메시지 형식 오류, 무시", tracker.addr),
        }
    }

    fn handle_tracker_command(&mut self, tracker: &mut Tracker, command: TrackerCommand, now: Instant) {
        match command {
            TrackerCommand::Welcome(addr) => self.on_welcome(tracker, addr, now),

            TrackerCommand::Unknown(addr) => {
                self.events.push(NodeEvent::TrackerFailure {
                    tracker: tracker.addr,
                    reason: format!("트래커가 {} 를 모름", addr),
                });
                self.on_unknown_peer(addr);
            }

            TrackerCommand::SendPub { addr, public_key } => {
                self.on_send_pub(addr, public_key, now);
            }

            TrackerCommand::SendRand(addr) => {
                if Some(addr) != self.my_address {
                    debug!("디코이 전송 → {} (트래커 {} 요청)", addr, tracker.addr);
                    self.emit(addr, decoy());
                    self.stats.decoys_sent += 1;
                }
            }

            TrackerCommand::Seeder { account, peers } => {
                debug!("시더 목록 {}: {}개", account, peers.len());
                self.gossip.replace(&account, peers);
            }

            TrackerCommand::Seeding { account, addr } => self.gossip.insert(&account, addr),

            TrackerCommand::Unseeding { account, addr } => self.gossip.remove(&account, &addr),
        }
    }

    fn on_welcome(&mut self, tracker: &mut Tracker, addr: SocketAddr, now: Instant) {
        let first = !tracker.connected;
        tracker.connected = true;
        tracker.next_keep_alive = now + self.config.keep_alive_interval;

        if self.my_address != Some(addr) {
            if let Some(previous) = self.my_address {
                self.gossip.forget(&previous);
            }
            self.my_address = Some(addr);
            self.gossip.invalidate_all();
        }

        // 이후의 welcome은 keep-alive 응답
        if !first {
            return;
        }

        info!("트래커 {} 연결, 외부 주소 {}", tracker.addr, addr);
        self.send_tracker(tracker, &TrackerRequest::SetPub(self.keys.public_key_bytes()));

        let seeding: Vec<String> = self.seeding.iter().cloned().collect();
        for account in seeding {
            self.send_tracker(tracker, &TrackerRequest::Seed(account));
        }

        // 연결 전에 시작된 조회를 이 트래커에도 요청
        for peer_addr in self.registry.peer_addresses() {
            let resolving = self
                .registry
                .peer(&peer_addr)
                .is_some_and(|p| matches!(p.link, Link::Resolving { .. }));
            if !resolving {
                continue;
            }
            if self.send_tracker(tracker, &TrackerRequest::Announce(peer_addr)) {
                if let Some(Link::Resolving { asked, .. }) =
                    self.registry.peer_mut(&peer_addr).map(|p| &mut p.link)
                {
                    *asked += 1;
                }
            }
        }
    }

    /// 대상 피어의 실제 주소/공개키 수신
    fn on_send_pub(&mut self, addr: SocketAddr, public_key: PublicKeyBytes, now: Instant) {
        let Some(mut peer) = self.registry.take_peer(&addr) else {
            debug!("요청하지 않은 sendpub {} 무시", addr);
            return;
        };

        if matches!(peer.link, Link::Resolving { .. }) {
            peer.public_key = Some(public_key);
            if !self.start_handshake(&mut peer, now) {
                self.abandon_connect(&mut peer, "피어 공개키 거부");
            }
        } else {
            debug!("sendpub {} 무시 ({})", addr, peer.link.name());
        }
        self.registry.insert_peer(peer);
    }

    /// 모든 트래커가 모른다고 하면 연결 실패
    fn on_unknown_peer(&mut self, addr: SocketAddr) {
        let Some(mut peer) = self.registry.take_peer(&addr) else {
            return;
        };

        if let Link::Resolving { asked, unknown, .. } = &mut peer.link {
            *unknown += 1;
            if *unknown >= *asked {
                self.abandon_connect(&mut peer, "어떤 트래커도 피어를 모름");
            }
        }

        if matches!(peer.link, Link::Idle) && peer.public_key.is_none() {
            self.remove_peer(peer, "주소 조회 실패");
        } else {
            self.registry.insert_peer(peer);
        }
    }

    /// 한 트래커에 요청 전송
    pub(crate) fn send_tracker(&mut self, tracker: &Tracker, request: &TrackerRequest) -> bool {
        let plain = match serde_json::to_vec(&request.to_value()) {
            Ok(plain) => plain,
            Err(e) => {
                warn!("트래커 요청 직렬화 실패: {}", e);
                return false;
            }
        };
        match tracker.seal(&plain) {
            Some(data) => {
                self.emit(tracker.addr, data);
                true
            }
            None => false,
        }
    }

    /// 연결된 모든 트래커에 요청. 보낸 수 반환
    pub(crate) fn request_trackers(&mut self, request: &TrackerRequest) -> usize {
        let plain = match serde_json::to_vec(&request.to_value()) {
            Ok(plain) => plain,
            Err(e) => {
                warn!("트래커 요청 직렬화 실패: {}", e);
                return 0;
            }
        };

        let sealed: Vec<(SocketAddr, Vec<u8>)> = self
            .registry
            .connected_trackers()
            .iter()
            .filter_map(|addr| self.registry.tracker(addr))
            .filter_map(|tracker| tracker.seal(&plain).map(|data| (tracker.addr, data)))
            .collect();

        let count = sealed.len();
        for (to, data) in sealed {
            self.emit(to, data);
        }
        count
    }
}
