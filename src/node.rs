//! 프로토콜 엔진
//!
//! 소켓/타이머를 직접 다루지 않는다. 호출자가 현재 시각과 함께
//! 데이터그램·틱·요청을 넣으면, 엔진은 보낼 데이터그램을 `Outbox`에,
//! 애플리케이션 이벤트를 이벤트 목록에 쌓는다.
//!
//! 모든 상태(레지스트리, 시더 목록, 전송 상태)는 이 구조체 하나가 소유하고
//! 하나의 태스크에서만 변경된다.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::{Bootstrap, Config};
use crate::crypto::{decoy, offer_session, KeyPair, PublicKeyBytes, SessionCipher, PUBLIC_KEY_SIZE};
use crate::gossip::GossipState;
use crate::media::MediaCatalog;
use crate::message::{
    decode_frame, validate_address, Frame, PeerMessage, TrackerRequest, CMD_HANDSHAKE,
};
use crate::peer::{Link, Peer, PeerInfo};
use crate::registry::{EndpointKind, Registry};
use crate::stats::NodeStats;
use crate::storage::Storage;
use crate::tracker::Tracker;
use crate::transport::Outbox;
use crate::{Error, Result};

/// 애플리케이션 이벤트
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// 복호화된 애플리케이션 페이로드
    Message { peer: PeerInfo, payload: Value },

    /// 검증을 통과해 저장된 미디어
    MediaReceived { peer: PeerInfo, key: String },

    /// 트래커 쪽 문제 (피어 없음)
    TrackerFailure { tracker: SocketAddr, reason: String },
}

/// `send` 결과
#[derive(Debug)]
pub enum Delivery {
    /// 세션이 있어 바로 전송 (시도 횟수)
    Sent(u32),

    /// 연결 수립 후 전송. 성공 시 사용한 시도 횟수
    Pending(oneshot::Receiver<Result<u32>>),
}

/// 피어 데이터그램 처리 후 피어의 운명
enum Disposition {
    Keep,
    Remove(&'static str),
    /// 제거 후 미지 주소에서 온 것처럼 다시 처리
    Redispatch,
}

/// 노드 프로토콜 엔진
pub struct Node {
    pub(crate) config: Config,
    pub(crate) keys: KeyPair,
    pub(crate) registry: Registry,
    pub(crate) gossip: GossipState,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) catalog: Arc<dyn MediaCatalog>,
    pub(crate) my_address: Option<SocketAddr>,
    pub(crate) seeding: BTreeSet<String>,
    pub(crate) outbox: Outbox,
    pub(crate) events: Vec<NodeEvent>,
    pub(crate) stats: NodeStats,
    next_sweep: Instant,
}

impl Node {
    /// 부트스트랩 목록으로 엔진 생성. 쓸 수 있는 트래커가 없으면 에러
    pub fn new(
        config: Config,
        keys: KeyPair,
        bootstrap: &Bootstrap,
        storage: Arc<dyn Storage>,
        catalog: Arc<dyn MediaCatalog>,
        now: Instant,
    ) -> Result<Self> {
        let mut registry = Registry::new();

        for (addr, key) in &bootstrap.trackers {
            match Tracker::new(*addr, *key, config.max_trial, now) {
                Some(tracker) => registry.insert_tracker(tracker),
                None => warn!("트래커 {} 공개키로 키 교환 불가, 제외", addr),
            }
        }
        if registry.tracker_count() == 0 {
            return Err(Error::NoTrackers);
        }

        for (addr, key) in &bootstrap.peers {
            if registry.kind_of(addr).is_none() {
                registry.insert_peer(Peer::new(*addr, *key, config.max_trial, now));
            }
        }

        info!(
            "노드 준비: 트래커 {}개, 피어 {}개, 공개키 {}",
            registry.tracker_count(),
            registry.peer_count(),
            hex::encode(keys.public_key_bytes())
        );

        Ok(Self {
            next_sweep: now + config.poll_interval,
            config,
            keys,
            registry,
            gossip: GossipState::new(),
            storage,
            catalog,
            my_address: None,
            seeding: BTreeSet::new(),
            outbox: Outbox::new(),
            events: Vec::new(),
            stats: NodeStats::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 노드 장기 공개키
    pub fn public_key(&self) -> PublicKeyBytes {
        self.keys.public_key_bytes()
    }

    /// 트래커가 알려준 외부 주소
    pub fn my_address(&self) -> Option<SocketAddr> {
        self.my_address
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<&Peer> {
        self.registry.peer(addr)
    }

    pub fn tracker(&self, addr: &SocketAddr) -> Option<&Tracker> {
        self.registry.tracker(addr)
    }

    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    pub fn gossip(&self) -> &GossipState {
        &self.gossip
    }

    pub fn seeding(&self) -> impl Iterator<Item = &str> {
        self.seeding.iter().map(String::as_str)
    }

    /// 쌓인 송신 데이터그램
    pub fn take_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn emit(&mut self, to: SocketAddr, data: Vec<u8>) {
        self.stats.record_out(data.len());
        self.outbox.send(to, data);
    }

    /// 세션으로 암호화해 전송
    pub(crate) fn send_frame(&mut self, peer: &mut Peer, plain: &[u8], now: Instant) -> bool {
        match peer.seal(plain) {
            Some(data) => {
                self.emit(peer.addr, data);
                peer.next_send = now + self.config.access_cooldown;
                true
            }
            None => {
                warn!("세션 없는 피어 {}로 전송 시도 ({})", peer.addr, peer.link.name());
                false
            }
        }
    }

    pub(crate) fn send_message(&mut self, peer: &mut Peer, message: &PeerMessage, now: Instant) -> bool {
        match serde_json::to_vec(&message.to_value()) {
            Ok(plain) => self.send_frame(peer, &plain, now),
            Err(e) => {
                warn!("메시지 직렬화 실패: {}", e);
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // 수신
    // ─────────────────────────────────────────────────────────────────

    /// 수신 데이터그램 처리
    pub fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        self.stats.record_in(data.len());

        if data.len() > self.config.max_payload {
            debug!("너무 큰 데이터그램 무시 ← {}: {} bytes", from, data.len());
            return;
        }

        match self.registry.kind_of(&from) {
            Some(EndpointKind::Tracker) => {
                if let Some(mut tracker) = self.registry.take_tracker(&from) {
                    self.handle_tracker_datagram(&mut tracker, data, now);
                    self.registry.insert_tracker(tracker);
                }
            }
            Some(EndpointKind::Peer) => self.handle_peer_datagram(from, data, now),
            None => self.handle_unknown_datagram(from, data, now),
        }
    }

    /// 미지 주소: 공개키 크기 데이터그램만 핸드쉐이크로 받음
    fn handle_unknown_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        if data.len() != PUBLIC_KEY_SIZE || Some(from) == self.my_address || !validate_address(from) {
            trace!("미지 주소 {} 데이터그램 무시 ({} bytes)", from, data.len());
            return;
        }

        let mut peer = Peer::new(from, None, self.config.max_trial, now);
        if self.accept_handshake(&mut peer, key_from(data), now) {
            self.registry.insert_peer(peer);
        }
    }

    fn handle_peer_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let Some(mut peer) = self.registry.take_peer(&from) else {
            return;
        };

        match self.process_peer_datagram(&mut peer, data, now) {
            Disposition::Keep => self.registry.insert_peer(peer),
            Disposition::Remove(reason) => self.remove_peer(peer, reason),
            Disposition::Redispatch => {
                self.remove_peer(peer, "응답 없던 피어의 재접속");
                self.handle_unknown_datagram(from, data, now);
            }
        }
    }

    fn process_peer_datagram(&mut self, peer: &mut Peer, data: &[u8], now: Instant) -> Disposition {
        if data.is_empty() {
            return Disposition::Keep;
        }

        let silent = now.saturating_duration_since(peer.last_access);
        if peer.is_established() && silent > self.config.last_access_limit {
            warn!("{:?} 동안 조용했던 피어 {}", silent, peer.addr);
            if peer.is_sender {
                return Disposition::Redispatch;
            }
            if !self.reoffer(peer, now) {
                return Disposition::Remove("재핸드쉐이크 불가");
            }
            return Disposition::Keep;
        }

        let decrypted = peer.cipher().map(|cipher| cipher.decrypt(data));
        match decrypted {
            Some(Ok(plain)) => self.process_plain(peer, &plain, now),
            Some(Err(_)) | None if data.len() == PUBLIC_KEY_SIZE => {
                self.on_peer_key(peer, key_from(data), now);
                Disposition::Keep
            }
            // 세션 전에는 디코이 등이 올 수 있음
            None => Disposition::Keep,
            Some(Err(_)) if matches!(peer.link, Link::Offered { .. }) => Disposition::Keep,
            Some(Err(_)) => self.fault(peer, "복호화 실패"),
        }
    }

    /// 이미 아는 피어가 보낸 핸드쉐이크 키
    fn on_peer_key(&mut self, peer: &mut Peer, key: PublicKeyBytes, now: Instant) {
        match &peer.link {
            // 확인 메시지 유실, 다시 응답
            Link::Accepted { remote_public, .. } if *remote_public == key => {
                self.send_message(peer, &PeerMessage::Handshake, now);
            }
            // 동시 연결: 키가 큰 쪽의 제안만 수락
            Link::Offered { local_public, .. } if key <= *local_public => {
                debug!("동시 연결 {}: 상대가 우리 제안을 수락할 차례", peer.addr);
            }
            _ => {
                self.accept_handshake(peer, key, now);
            }
        }
    }

    /// 상대 키로 세션 유도 후 확인 메시지 응답. 실패하면 디코이
    fn accept_handshake(&mut self, peer: &mut Peer, remote: PublicKeyBytes, now: Instant) -> bool {
        let Some(session) = self.keys.session_key(&remote) else {
            debug!("핸드쉐이크 키 거부 ← {}, 디코이 응답", peer.addr);
            self.emit(peer.addr, decoy());
            self.stats.decoys_sent += 1;
            return false;
        };

        peer.link = Link::Accepted {
            remote_public: remote,
            cipher: SessionCipher::new(&session),
        };
        peer.is_sender = true;
        peer.keep_alive = true;
        peer.last_access = now;
        self.stats.handshakes_accepted += 1;
        debug!("핸드쉐이크 수락 ← {}", peer.addr);

        self.send_message(peer, &PeerMessage::Handshake, now);
        true
    }

    /// 복호화된 평문
    fn process_plain(&mut self, peer: &mut Peer, plain: &[u8], now: Instant) -> Disposition {
        let Some(frame) = decode_frame(plain) else {
            return self.fault(peer, "형식 오류");
        };

        if peer.is_established() {
            let since = now.saturating_duration_since(peer.last_access);
            if !peer.media_active() && since < self.config.access_cooldown {
                return self.fault(peer, "쿨다운 위반");
            }
            peer.last_access = now;
            peer.quality = self.config.max_trial;
            return self.dispatch_frame(peer, frame, now);
        }

        // 첫 복호화 성공이 핸드쉐이크 확인
        let offered = matches!(peer.link, Link::Offered { .. });
        peer.last_access = now;
        let attempts = peer.promote(self.config.max_trial);
        self.stats.handshakes_completed += 1;
        info!("세션 확립: {} ({}회 시도)", peer.addr, attempts);

        if offered {
            self.send_message(peer, &PeerMessage::Handshake, now);
        }
        peer.resolve_connected(attempts);

        if is_handshake(&frame) {
            return Disposition::Keep;
        }
        self.dispatch_frame(peer, frame, now)
    }

    fn dispatch_frame(&mut self, peer: &mut Peer, frame: Frame, now: Instant) -> Disposition {
        match frame {
            Frame::Message(value) => match PeerMessage::parse(value) {
                None => return self.fault(peer, "잘못된 프로토콜 명령"),
                Some(PeerMessage::Handshake) => {}
                Some(PeerMessage::MediaRequest(request)) => {
                    self.on_media_request(peer, request, now)
                }
                Some(PeerMessage::MediaStatus { code, seq }) => {
                    self.on_media_status(peer, code, seq, now)
                }
                Some(PeerMessage::Application(payload)) => {
                    self.stats.messages_delivered += 1;
                    self.events.push(NodeEvent::Message {
                        peer: PeerInfo::from(&*peer),
                        payload,
                    });
                }
            },
            Frame::Media(frame) => self.on_media_frame(peer, frame, now),
        }
        Disposition::Keep
    }

    /// 일시적 결함: quality 감소, 0이면 제거
    fn fault(&mut self, peer: &mut Peer, what: &'static str) -> Disposition {
        self.stats.peer_faults += 1;
        warn!("피어 결함 {}: {} (quality {})", peer.addr, what, peer.quality);
        if peer.fault() {
            Disposition::Remove("결함 누적")
        } else {
            Disposition::Keep
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // 연결
    // ─────────────────────────────────────────────────────────────────

    /// 알려진 공개키로 핸드쉐이크 시작 (첫 시도 전송)
    pub(crate) fn start_handshake(&mut self, peer: &mut Peer, now: Instant) -> bool {
        let Some(remote) = peer.public_key else {
            return false;
        };
        let Some((local_public, cipher)) = offer_session(&remote) else {
            warn!("피어 {} 공개키로 키 교환 불가", peer.addr);
            return false;
        };

        peer.link = Link::Offered {
            local_public,
            cipher,
            next_attempt: now + self.config.handshake_interval,
        };
        peer.quality = self.config.max_trial.saturating_sub(1);
        peer.keep_alive = false;
        peer.is_sender = false;
        debug!("핸드쉐이크 시작 → {}", peer.addr);
        self.emit(peer.addr, local_public.to_vec());
        true
    }

    /// 우리가 시작한 연결이 조용해짐: 낡은 세션을 버리고 새 핸드쉐이크 제안
    fn reoffer(&mut self, peer: &mut Peer, now: Instant) -> bool {
        debug!("낡은 세션 폐기, 재핸드쉐이크 → {}", peer.addr);
        peer.link = Link::Idle;
        peer.keep_alive = false;
        self.start_handshake(peer, now)
    }

    /// 연결 시도 실패: 대기자에게 알리고 세션 없는 상태로
    pub(crate) fn abandon_connect(&mut self, peer: &mut Peer, reason: &str) {
        warn!("연결 실패 → {}: {}", peer.addr, reason);
        peer.resolve_failed(self.config.max_trial);
        let dropped = peer.clear_queue();
        if dropped > 0 {
            debug!("전송 대기 {}개 폐기", dropped);
        }
        peer.link = Link::Idle;
        peer.quality = self.config.max_trial;
    }

    /// 레지스트리에서 빠진 피어 정리
    pub(crate) fn remove_peer(&mut self, mut peer: Peer, reason: &str) {
        info!("피어 제거 {}: {}", peer.addr, reason);
        peer.resolve_failed(self.config.max_trial);
        peer.clear_queue();
        self.abort_media(&mut peer);
        self.stats.peers_removed += 1;
    }

    // ─────────────────────────────────────────────────────────────────
    // 송신
    // ─────────────────────────────────────────────────────────────────

    /// 피어에게 JSON 배열/객체 전송. 처음 보는 주소면 트래커로 연결부터 수립
    pub fn send(&mut self, target: SocketAddr, payload: &Value, now: Instant) -> Result<Delivery> {
        if !(payload.is_array() || payload.is_object()) {
            return Err(Error::InvalidPayload);
        }
        let plain = serde_json::to_vec(payload)?;
        if plain.len() > self.config.mtu {
            return Err(Error::PayloadTooLarge {
                size: plain.len(),
                limit: self.config.mtu,
            });
        }
        if !validate_address(target)
            || Some(target) == self.my_address
            || self.registry.kind_of(&target) == Some(EndpointKind::Tracker)
        {
            return Err(Error::InvalidTarget(target));
        }

        let mut peer = self
            .registry
            .take_peer(&target)
            .unwrap_or_else(|| Peer::new(target, None, self.config.max_trial, now));
        let delivery = self.deliver(&mut peer, plain, now);
        self.registry.insert_peer(peer);
        Ok(delivery)
    }

    fn deliver(&mut self, peer: &mut Peer, plain: Vec<u8>, now: Instant) -> Delivery {
        peer.queue(plain);

        if peer.can_send() {
            self.pump(peer, now);
            return Delivery::Sent(1);
        }

        let (tx, rx) = oneshot::channel();
        peer.add_waiter(tx);

        if matches!(peer.link, Link::Idle) {
            let asked = self.request_trackers(&TrackerRequest::Announce(peer.addr));
            if peer.public_key.is_some() {
                if !self.start_handshake(peer, now) {
                    self.abandon_connect(peer, "피어 공개키 거부");
                }
            } else {
                debug!("트래커 {}곳에 {} 조회", asked, peer.addr);
                peer.link = Link::Resolving {
                    deadline: now + self.config.handshake_interval * self.config.max_trial,
                    asked,
                    unknown: 0,
                };
            }
        }

        Delivery::Pending(rx)
    }

    /// 대기 페이로드를 쿨다운 간격으로 하나씩 전송
    fn pump(&mut self, peer: &mut Peer, now: Instant) {
        while let Some(plain) = peer.next_queued(now) {
            if !self.send_frame(peer, &plain, now) {
                break;
            }
        }
    }

    /// 계정 시더 중 결정적으로 고른 최대 `n`곳에 전송
    pub fn broadcast(&mut self, account: &str, n: usize, payload: &Value, now: Instant) -> bool {
        let size = match serde_json::to_vec(payload) {
            Ok(plain) => plain.len(),
            Err(_) => return false,
        };
        if size > self.config.mtu {
            warn!("브로드캐스트 페이로드 초과: {} > {}", size, self.config.mtu);
            return false;
        }

        let targets = self.gossip.select(account, n, self.my_address);
        let mut sent = 0;
        for target in &targets {
            match self.send(*target, payload, now) {
                Ok(_) => sent += 1,
                Err(e) => debug!("브로드캐스트 대상 {} 제외: {}", target, e),
            }
        }

        debug!("브로드캐스트 {}: {}/{}곳", account, sent, targets.len());
        if sent > 0 {
            self.stats.broadcasts += 1;
        }
        sent > 0
    }

    /// 계정 시딩 시작 (트래커에 알림, 재연결 시 다시 알림)
    pub fn seed(&mut self, account: &str) -> bool {
        if account.is_empty() {
            return false;
        }
        self.seeding.insert(account.to_string());
        self.request_trackers(&TrackerRequest::Seed(account.to_string()));
        true
    }

    pub fn unseed(&mut self, account: &str) -> bool {
        if !self.seeding.remove(account) {
            return false;
        }
        self.request_trackers(&TrackerRequest::Unseed(account.to_string()));
        true
    }

    // ─────────────────────────────────────────────────────────────────
    // 타이머
    // ─────────────────────────────────────────────────────────────────

    /// 스케줄러 틱: 재시도, keep-alive, 미디어 타임아웃, 생존 확인
    pub fn on_tick(&mut self, now: Instant) {
        for addr in self.registry.tracker_addresses() {
            if let Some(mut tracker) = self.registry.take_tracker(&addr) {
                self.tick_tracker(&mut tracker, now);
                self.registry.insert_tracker(tracker);
            }
        }

        for addr in self.registry.peer_addresses() {
            let Some(mut peer) = self.registry.take_peer(&addr) else {
                continue;
            };
            match self.tick_peer(&mut peer, now) {
                Disposition::Remove(reason) => self.remove_peer(peer, reason),
                _ => self.registry.insert_peer(peer),
            }
        }

        if now >= self.next_sweep {
            self.next_sweep = now + self.config.poll_interval;
            let sweep = self.registry.sweep(now, self.config.last_access_limit);
            for peer in sweep.removed {
                self.remove_peer(peer, "생존 확인 만료");
            }
            // 공개키를 모르면 세션 없이 남겨 두고, 다음 전송 때 트래커로 조회
            for addr in sweep.stale {
                if let Some(mut peer) = self.registry.take_peer(&addr) {
                    self.reoffer(&mut peer, now);
                    self.registry.insert_peer(peer);
                }
            }
        }
    }

    fn tick_peer(&mut self, peer: &mut Peer, now: Instant) -> Disposition {
        match peer.link {
            Link::Resolving { deadline, .. } if now >= deadline => {
                self.abandon_connect(peer, "트래커 조회 시간 초과");
                if peer.public_key.is_none() {
                    return Disposition::Remove("주소 조회 실패");
                }
            }
            Link::Offered { next_attempt, .. } if now >= next_attempt => {
                self.retry_handshake(peer, now);
            }
            _ => {}
        }

        if peer.can_send() {
            self.pump(peer, now);
            self.tick_media(peer, now);
        }
        Disposition::Keep
    }

    /// 같은 임시 키 재전송. 시도를 다 쓰면 포기
    fn retry_handshake(&mut self, peer: &mut Peer, now: Instant) {
        if peer.quality == 0 {
            self.abandon_connect(peer, "핸드쉐이크 시도 소진");
            return;
        }
        let Link::Offered {
            local_public,
            next_attempt,
            ..
        } = &mut peer.link
        else {
            return;
        };
        *next_attempt = now + self.config.handshake_interval;
        let key = *local_public;
        peer.quality -= 1;
        debug!("핸드쉐이크 재시도 → {} (남은 {})", peer.addr, peer.quality);
        self.emit(peer.addr, key.to_vec());
    }
}

fn key_from(data: &[u8]) -> PublicKeyBytes {
    let mut key = [0u8; PUBLIC_KEY_SIZE];
    key.copy_from_slice(&data[..PUBLIC_KEY_SIZE]);
    key
}

fn is_handshake(frame: &Frame) -> bool {
    match frame {
        Frame::Message(Value::Array(items)) => {
            items.len() == 1 && items[0].as_str() == Some(CMD_HANDSHAKE)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::crypto::{hash_content, offer_session};
    use crate::media::{MediaSlot, MemoryCatalog};
    use crate::message::MediaCode;
    use crate::rendezvous::TrackerServer;
    use crate::storage::MemoryStorage;

    const STEP: Duration = Duration::from_millis(50);

    fn rounds(span: Duration) -> usize {
        (span.as_millis() / STEP.as_millis()) as usize
    }

    fn tracker_addr() -> SocketAddr {
        "1.2.3.4:12345".parse().unwrap()
    }

    fn alice_addr() -> SocketAddr {
        "203.0.113.9:40001".parse().unwrap()
    }

    fn bob_addr() -> SocketAddr {
        "198.51.100.7:40002".parse().unwrap()
    }

    struct TestNode {
        addr: SocketAddr,
        node: Node,
        storage: Arc<MemoryStorage>,
        catalog: Arc<MemoryCatalog>,
    }

    /// 트래커 1개 + 노드들, 가상 시계로 데이터그램을 주고받음
    struct Net {
        now: Instant,
        tracker: TrackerServer,
        nodes: Vec<TestNode>,
        /// (from, to, 통과시킬 개수): 이후 이 경로의 데이터그램은 버림
        drop_link: Option<(SocketAddr, SocketAddr, usize)>,
        /// 경로별로 보낸 데이터그램 수 (유실 포함)
        traffic: HashMap<(SocketAddr, SocketAddr), usize>,
    }

    impl Net {
        fn new(addrs: &[SocketAddr]) -> Self {
            let now = Instant::now();
            let tracker_keys = KeyPair::generate();
            let bootstrap = Bootstrap {
                trackers: vec![(tracker_addr(), tracker_keys.public_key_bytes())],
                peers: Vec::new(),
            };
            let config = Config::default();

            let nodes = addrs
                .iter()
                .map(|addr| {
                    let storage = Arc::new(MemoryStorage::new());
                    let catalog = Arc::new(MemoryCatalog::new());
                    let node = Node::new(
                        config.clone(),
                        KeyPair::generate(),
                        &bootstrap,
                        storage.clone(),
                        catalog.clone(),
                        now,
                    )
                    .unwrap();
                    TestNode {
                        addr: *addr,
                        node,
                        storage,
                        catalog,
                    }
                })
                .collect();

            Self {
                now,
                tracker: TrackerServer::new(config, tracker_keys),
                nodes,
                drop_link: None,
                traffic: HashMap::new(),
            }
        }

        fn node(&mut self, addr: SocketAddr) -> &mut Node {
            &mut self
                .nodes
                .iter_mut()
                .find(|n| n.addr == addr)
                .unwrap()
                .node
        }

        fn test_node(&self, addr: SocketAddr) -> &TestNode {
            self.nodes.iter().find(|n| n.addr == addr).unwrap()
        }

        /// 한 라운드: 시계 전진, 틱, 쌓인 데이터그램 배달
        fn round(&mut self) {
            self.now += STEP;
            let now = self.now;
            self.tracker.on_tick(now);
            for n in &mut self.nodes {
                n.node.on_tick(now);
            }
            self.deliver();
        }

        /// 응답이 없을 때까지 같은 시각에 배달
        fn deliver(&mut self) {
            let now = self.now;
            for _ in 0..256 {
                let mut datagrams: Vec<(SocketAddr, SocketAddr, Vec<u8>)> = self
                    .tracker
                    .take_outbox()
                    .drain()
                    .into_iter()
                    .map(|(to, data)| (tracker_addr(), to, data))
                    .collect();
                for n in &mut self.nodes {
                    let from = n.addr;
                    datagrams.extend(
                        n.node
                            .take_outbox()
                            .drain()
                            .into_iter()
                            .map(|(to, data)| (from, to, data)),
                    );
                }
                if datagrams.is_empty() {
                    return;
                }

                for (from, to, data) in datagrams {
                    *self.traffic.entry((from, to)).or_default() += 1;
                    if self.dropped(from, to) {
                        continue;
                    }
                    if to == tracker_addr() {
                        self.tracker.handle_datagram(from, &data, now);
                    } else if let Some(n) = self.nodes.iter_mut().find(|n| n.addr == to) {
                        n.node.handle_datagram(from, &data, now);
                    }
                }
            }
            panic!("데이터그램이 끝없이 오감");
        }

        fn dropped(&mut self, from: SocketAddr, to: SocketAddr) -> bool {
            match &mut self.drop_link {
                Some((f, t, budget)) if *f == from && *t == to => {
                    if *budget == 0 {
                        return true;
                    }
                    *budget -= 1;
                    false
                }
                _ => false,
            }
        }

        fn sent(&self, from: SocketAddr, to: SocketAddr) -> usize {
            self.traffic.get(&(from, to)).copied().unwrap_or(0)
        }

        fn run(&mut self, rounds: usize) {
            for _ in 0..rounds {
                self.round();
            }
        }

        /// 조건이 참이 될 때까지 (최대 `limit` 라운드)
        fn run_until(&mut self, limit: usize, mut done: impl FnMut(&mut Net) -> bool) -> bool {
            for _ in 0..limit {
                if done(self) {
                    return true;
                }
                self.round();
            }
            done(self)
        }

        /// 미디어 결과 코드 대기
        fn wait_media(&mut self, rx: &mut oneshot::Receiver<MediaCode>) -> Option<MediaCode> {
            let mut result = None;
            self.run_until(200, |_| {
                if let Ok(code) = rx.try_recv() {
                    result = Some(code);
                }
                result.is_some()
            });
            result
        }

        fn connect(&mut self) {
            let ok = self.run_until(100, |net| {
                net.nodes.iter().all(|n| n.node.my_address() == Some(n.addr))
            });
            assert!(ok, "트래커 연결 실패");
        }

        /// alice → bob 세션 수립 후 첫 메시지 전달
        fn establish(&mut self, from: SocketAddr, to: SocketAddr) {
            let now = self.now;
            let delivery = self.node(from).send(to, &json!(["hello"]), now).unwrap();
            let Delivery::Pending(mut rx) = delivery else {
                panic!("세션 없이 바로 전송됨");
            };
            let ok = self.run_until(200, |_| matches!(rx.try_recv(), Ok(Ok(_))));
            assert!(ok, "연결 실패");
            self.run(5);
            assert!(self.node(from).peer(&to).unwrap().is_established());
            assert!(self.node(to).peer(&from).unwrap().is_established());
            self.node(to).drain_events();
        }
    }

    fn standalone(now: Instant) -> Node {
        let bootstrap = Bootstrap {
            trackers: vec![(tracker_addr(), KeyPair::generate().public_key_bytes())],
            peers: Vec::new(),
        };
        Node::new(
            Config::default(),
            KeyPair::generate(),
            &bootstrap,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryCatalog::new()),
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_requires_tracker() {
        let result = Node::new(
            Config::default(),
            KeyPair::generate(),
            &Bootstrap::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryCatalog::new()),
            Instant::now(),
        );
        assert!(matches!(result, Err(Error::NoTrackers)));
    }

    #[test]
    fn test_handshake_idempotence() {
        let now = Instant::now();
        let mut node = standalone(now);
        let initiator: SocketAddr = "198.51.100.20:5000".parse().unwrap();
        let (offered, cipher) = offer_session(&node.public_key()).unwrap();

        node.handle_datagram(initiator, &offered, now);
        node.handle_datagram(initiator, &offered, now + STEP);

        assert_eq!(node.peer_count(), 1);
        let peer = node.peer(&initiator).unwrap();
        assert!(peer.is_sender);
        assert!(peer.keep_alive);

        // 두 번 모두 같은 세션의 확인 메시지
        let replies = node.take_outbox().drain();
        assert_eq!(replies.len(), 2);
        for (to, data) in replies {
            assert_eq!(to, initiator);
            let plain = cipher.decrypt(&data).unwrap();
            assert_eq!(decode_frame(&plain), Some(Frame::Message(json!(["handshake"]))));
        }
    }

    #[test]
    fn test_rejected_key_gets_decoy() {
        let now = Instant::now();
        let mut node = standalone(now);
        let prober: SocketAddr = "198.51.100.21:5000".parse().unwrap();

        node.handle_datagram(prober, &[0u8; PUBLIC_KEY_SIZE], now);
        assert_eq!(node.peer_count(), 0);

        let replies = node.take_outbox().drain();
        assert_eq!(replies.len(), 1);
        assert_ne!(replies[0].1.len(), PUBLIC_KEY_SIZE);

        // 다른 크기는 조용히 무시
        node.handle_datagram(prober, &[1u8; 40], now);
        assert!(node.take_outbox().is_empty());
    }

    #[test]
    fn test_quality_bound() {
        let now = Instant::now();
        let mut node = standalone(now);
        let max_trial = node.config().max_trial;
        let initiator: SocketAddr = "198.51.100.22:5000".parse().unwrap();
        let (offered, cipher) = offer_session(&node.public_key()).unwrap();

        node.handle_datagram(initiator, &offered, now);
        let confirm = cipher.encrypt(br#"["handshake"]"#).unwrap();
        node.handle_datagram(initiator, &confirm, now + STEP);
        assert!(node.peer(&initiator).unwrap().is_established());

        let garbage = vec![0xA5u8; 50];
        for i in 0..max_trial - 1 {
            node.handle_datagram(initiator, &garbage, now + STEP * (i + 2));
        }
        assert!(node.peer(&initiator).is_some());

        node.handle_datagram(initiator, &garbage, now + STEP * (max_trial + 2));
        assert!(node.peer(&initiator).is_none());
    }

    #[test]
    fn test_cooldown_violation_is_fault() {
        let now = Instant::now();
        let mut node = standalone(now);
        let initiator: SocketAddr = "198.51.100.23:5000".parse().unwrap();
        let (offered, cipher) = offer_session(&node.public_key()).unwrap();

        node.handle_datagram(initiator, &offered, now);
        node.handle_datagram(initiator, &cipher.encrypt(br#"["handshake"]"#).unwrap(), now);

        let later = now + Duration::from_secs(1);
        node.handle_datagram(initiator, &cipher.encrypt(br#"["post",1]"#).unwrap(), later);
        node.handle_datagram(initiator, &cipher.encrypt(br#"["post",2]"#).unwrap(), later);

        let delivered: Vec<_> = node.drain_events();
        assert_eq!(delivered.len(), 1);
        assert_eq!(node.stats().peer_faults, 1);
        assert_eq!(
            node.peer(&initiator).unwrap().quality,
            node.config().max_trial - 1
        );
    }

    #[test]
    fn test_oversize_rejected_without_datagram() {
        let now = Instant::now();
        let mut node = standalone(now);
        node.take_outbox();

        let big = json!(["post", "x".repeat(2000)]);
        assert!(matches!(
            node.send(bob_addr(), &big, now),
            Err(Error::PayloadTooLarge { .. })
        ));

        node.gossip.replace("acc", vec![bob_addr(), alice_addr()]);
        assert!(!node.broadcast("acc", 2, &big, now));

        assert!(node.take_outbox().is_empty());
        assert_eq!(node.peer_count(), 0);
    }

    #[test]
    fn test_invalid_targets() {
        let now = Instant::now();
        let mut node = standalone(now);

        assert!(matches!(
            node.send(tracker_addr(), &json!(["x"]), now),
            Err(Error::InvalidTarget(_))
        ));
        assert!(matches!(
            node.send("0.0.0.0:1".parse().unwrap(), &json!(["x"]), now),
            Err(Error::InvalidTarget(_))
        ));
        assert!(matches!(
            node.send(bob_addr(), &json!("text"), now),
            Err(Error::InvalidPayload)
        ));
    }

    #[test]
    fn test_broadcast_determinism_and_exclusion() {
        let now = Instant::now();
        let mut node = standalone(now);
        let me = alice_addr();
        node.my_address = Some(me);

        let seeders: Vec<SocketAddr> = (1..=8)
            .map(|i| format!("10.0.0.{}:4000", i).parse().unwrap())
            .chain(std::iter::once(me))
            .collect();
        node.gossip.replace("acc", seeders);

        assert!(node.broadcast("acc", 3, &json!(["post", "a"]), now));
        let mut first = node.registry.peer_addresses();
        first.sort();

        assert!(node.broadcast("acc", 3, &json!(["post", "b"]), now));
        let mut second = node.registry.peer_addresses();
        second.sort();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert!(!first.contains(&me));
    }

    #[test]
    fn test_broadcast_unknown_account() {
        let now = Instant::now();
        let mut node = standalone(now);
        assert!(!node.broadcast("nobody", 4, &json!(["post"]), now));
    }

    #[test]
    fn test_liveness_sweep() {
        let start = Instant::now();
        let mut node = standalone(start);
        let config = node.config().clone();
        let initiator: SocketAddr = "198.51.100.24:5000".parse().unwrap();
        let (offered, _) = offer_session(&node.public_key()).unwrap();
        node.handle_datagram(initiator, &offered, start);

        node.on_tick(start + config.last_access_limit);
        assert!(node.peer(&initiator).is_some());

        let late = start + config.last_access_limit + config.poll_interval;
        node.on_tick(late);
        assert!(node.peer(&initiator).is_none());
        assert_eq!(node.stats().peers_removed, 1);
    }

    #[test]
    fn test_connect_through_tracker() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        net.connect();

        let now = net.now;
        let Delivery::Pending(mut rx) = net
            .node(alice_addr())
            .send(bob_addr(), &json!(["post", {"text": "hi"}]), now)
            .unwrap()
        else {
            panic!("세션 없이 바로 전송됨");
        };

        let connected = net.run_until(200, |_| matches!(rx.try_recv(), Ok(Ok(1))));
        assert!(connected);

        let delivered = net.run_until(20, |net| {
            net.node(bob_addr())
                .events
                .iter()
                .any(|e| matches!(e, NodeEvent::Message { .. }))
        });
        assert!(delivered);

        let events = net.node(bob_addr()).drain_events();
        match &events[0] {
            NodeEvent::Message { peer, payload } => {
                assert_eq!(peer.addr, alice_addr());
                assert!(peer.is_sender);
                assert_eq!(payload, &json!(["post", {"text": "hi"}]));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // 수립 후에는 바로 전송
        net.run(2);
        let now = net.now;
        assert!(matches!(
            net.node(bob_addr()).send(alice_addr(), &json!(["like", 1]), now),
            Ok(Delivery::Sent(1))
        ));
    }

    #[test]
    fn test_unknown_target_fails() {
        let mut net = Net::new(&[alice_addr()]);
        net.connect();

        let now = net.now;
        let Ok(Delivery::Pending(mut rx)) =
            net.node(alice_addr())
                .send("198.51.100.99:4000".parse().unwrap(), &json!(["x"]), now)
        else {
            panic!("pending 아님");
        };

        let failed = net.run_until(20, |_| {
            matches!(rx.try_recv(), Ok(Err(Error::ConnectFailed { attempts: 5 })))
        });
        assert!(failed);
        assert!(net
            .node(alice_addr())
            .drain_events()
            .iter()
            .any(|e| matches!(e, NodeEvent::TrackerFailure { .. })));
    }

    fn catalog_media(net: &Net, receiver: SocketAddr, data: &[u8]) -> String {
        let key = "media/alice/1/0".to_string();
        net.test_node(receiver).catalog.insert(
            "alice",
            1,
            "0",
            MediaSlot {
                key: key.clone(),
                hash: hash_content(data),
            },
        );
        key
    }

    #[test]
    fn test_transfer_completeness() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        net.connect();
        net.establish(alice_addr(), bob_addr());

        let mtu = net.node(alice_addr()).config().mtu;
        let data: Vec<u8> = (0..mtu * 3 + 17).map(|i| (i % 251) as u8).collect();
        let key = catalog_media(&net, bob_addr(), &data);

        let now = net.now;
        let mut rx = net.node(alice_addr()).send_media(
            bob_addr(),
            "alice",
            1,
            "0",
            Bytes::from(data.clone()),
            now,
        );

        assert_eq!(net.wait_media(&mut rx), Some(MediaCode::Accepted));
        assert_eq!(net.node(alice_addr()).stats().media_chunks_sent, 4);
        assert_eq!(net.node(bob_addr()).stats().media_chunks_received, 4);
        assert_eq!(net.node(alice_addr()).stats().media_sent, 1);

        let stored = net.test_node(bob_addr()).storage.read(&key).unwrap();
        assert_eq!(hash_content(&stored), hash_content(&data));
        assert!(net
            .node(bob_addr())
            .drain_events()
            .iter()
            .any(|e| matches!(e, NodeEvent::MediaReceived { key: k, .. } if *k == key)));
        assert!(net.node(alice_addr()).peer(&bob_addr()).unwrap().media.is_none());

        // 이미 가진 미디어
        net.run(2);
        let now = net.now;
        let mut rx = net.node(alice_addr()).send_media(
            bob_addr(),
            "alice",
            1,
            "0",
            Bytes::from(data),
            now,
        );
        assert_eq!(net.wait_media(&mut rx), Some(MediaCode::MediaFound));
    }

    #[test]
    fn test_transfer_result_codes() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        net.connect();
        net.establish(alice_addr(), bob_addr());

        // 카탈로그에 없는 게시물
        let now = net.now;
        let mut rx = net.node(alice_addr()).send_media(
            bob_addr(),
            "alice",
            7,
            "0",
            Bytes::from_static(b"data"),
            now,
        );
        assert_eq!(net.wait_media(&mut rx), Some(MediaCode::PostNotFound));

        // 해시 불일치
        let declared = b"the real picture".to_vec();
        catalog_media(&net, bob_addr(), &declared);
        net.run(2);
        let now = net.now;
        let mut rx = net.node(alice_addr()).send_media(
            bob_addr(),
            "alice",
            1,
            "0",
            Bytes::from_static(b"a forged picture"),
            now,
        );
        assert_eq!(net.wait_media(&mut rx), Some(MediaCode::Declined));
        assert!(!net.test_node(bob_addr()).storage.exists("media/alice/1/0"));
    }

    #[test]
    fn test_retry_bound() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        net.connect();
        net.establish(alice_addr(), bob_addr());

        let data = vec![7u8; 3000];
        catalog_media(&net, bob_addr(), &data);

        // READY만 통과, 이후 bob → alice는 모두 유실
        net.drop_link = Some((bob_addr(), alice_addr(), 1));
        let now = net.now;
        let mut rx = net.node(alice_addr()).send_media(
            bob_addr(),
            "alice",
            1,
            "0",
            Bytes::from(data),
            now,
        );

        let max_trial = net.node(alice_addr()).config().max_trial as u64;
        assert_eq!(net.wait_media(&mut rx), Some(MediaCode::TimedOut));
        assert_eq!(net.node(alice_addr()).stats().media_chunks_sent, 1 + max_trial);
        assert_eq!(net.node(bob_addr()).stats().media_chunks_received, 1);
        assert!(net.node(alice_addr()).peer(&bob_addr()).unwrap().media.is_none());

        // 취소 마커로 수신측 상태도 정리됨
        net.drop_link = None;
        net.run(2);
        assert!(net.node(bob_addr()).peer(&alice_addr()).unwrap().media.is_none());
    }

    #[test]
    fn test_media_to_unconnected_peer() {
        let now = Instant::now();
        let mut node = standalone(now);
        let mut rx = node.send_media(bob_addr(), "alice", 1, "0", Bytes::from_static(b"x"), now);
        assert_eq!(rx.try_recv(), Ok(MediaCode::PeerErr));
    }

    #[test]
    fn test_seed_announced_on_welcome() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        assert!(net.node(alice_addr()).seed("acc"));
        net.connect();
        net.run(2);

        // bob이 시딩하면 트래커가 목록을 내려줌
        net.node(bob_addr()).seed("acc");
        net.run(3);

        let list = net.node(bob_addr()).gossip().list("acc").unwrap();
        assert!(list.peers().contains(&alice_addr()));
        let list = net.node(alice_addr()).gossip().list("acc").unwrap();
        assert!(list.peers().contains(&bob_addr()));

        assert!(net.node(alice_addr()).unseed("acc"));
        assert!(!net.node(alice_addr()).unseed("acc"));
    }

    #[test]
    fn test_silent_sender_rehandshakes() {
        let start = Instant::now();
        let mut node = standalone(start);
        let config = node.config().clone();
        let initiator: SocketAddr = "198.51.100.25:5000".parse().unwrap();
        let (offered, cipher) = offer_session(&node.public_key()).unwrap();
        node.handle_datagram(initiator, &offered, start);
        node.handle_datagram(initiator, &cipher.encrypt(br#"["handshake"]"#).unwrap(), start + STEP);
        assert!(node.peer(&initiator).unwrap().is_established());
        node.take_outbox();

        // 생존 확인 전에 상대가 새 키로 다시 연결
        let later = start + STEP + config.last_access_limit + Duration::from_secs(1);
        let (fresh, fresh_cipher) = offer_session(&node.public_key()).unwrap();
        node.handle_datagram(initiator, &fresh, later);

        assert_eq!(node.peer_count(), 1);
        assert_eq!(node.stats().peers_removed, 1);
        let peer = node.peer(&initiator).unwrap();
        assert!(peer.is_sender);
        assert!(matches!(peer.link, Link::Accepted { .. }));

        let replies = node.take_outbox().drain();
        assert_eq!(replies.len(), 1);
        let plain = fresh_cipher.decrypt(&replies[0].1).unwrap();
        assert_eq!(decode_frame(&plain), Some(Frame::Message(json!(["handshake"]))));
        assert!(cipher.decrypt(&replies[0].1).is_err());
    }

    #[test]
    fn test_silent_initiated_peer_reoffers() {
        let start = Instant::now();
        let mut node = standalone(start);
        let config = node.config().clone();
        let remote = KeyPair::generate();
        let target = bob_addr();
        node.registry.insert_peer(Peer::new(
            target,
            Some(remote.public_key_bytes()),
            config.max_trial,
            start,
        ));

        let Ok(Delivery::Pending(mut rx)) = node.send(target, &json!(["post", 1]), start) else {
            panic!("pending 아님");
        };
        let offered = node.take_outbox().drain();
        assert_eq!(offered.len(), 1);
        let first_key: PublicKeyBytes = offered[0].1.as_slice().try_into().unwrap();
        let session = SessionCipher::new(&remote.session_key(&first_key).unwrap());

        node.handle_datagram(target, &session.encrypt(br#"["handshake"]"#).unwrap(), start + STEP);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
        assert!(node.peer(&target).unwrap().is_established());
        node.take_outbox();

        // 상대는 오래된 세션으로 계속 보냄
        let later = start + STEP + config.last_access_limit + Duration::from_secs(1);
        node.handle_datagram(target, &session.encrypt(br#"["post",2]"#).unwrap(), later);

        let peer = node.peer(&target).unwrap();
        assert!(!peer.is_sender);
        assert!(!peer.keep_alive);
        assert!(matches!(peer.link, Link::Offered { .. }));

        let reoffered = node.take_outbox().drain();
        assert_eq!(reoffered.len(), 1);
        assert_eq!(reoffered[0].1.len(), PUBLIC_KEY_SIZE);
        assert_ne!(reoffered[0].1, offered[0].1);
        assert!(node.drain_events().is_empty());
    }

    #[test]
    fn test_initiator_reoffers_after_sweep() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        net.connect();
        net.establish(alice_addr(), bob_addr());
        let config = net.node(alice_addr()).config().clone();
        let completed = net.node(alice_addr()).stats().handshakes_completed;

        // 양쪽 모두 생존 확인 한도를 넘길 만큼 조용히
        net.run(rounds(config.last_access_limit + config.poll_interval * 2));

        // bob은 alice를 지우고, alice는 새 핸드쉐이크로 다시 연결
        assert_eq!(net.node(bob_addr()).stats().peers_removed, 1);
        assert!(net.node(bob_addr()).peer(&alice_addr()).is_some());
        let peer = net.node(alice_addr()).peer(&bob_addr()).unwrap();
        assert!(peer.is_established());
        assert!(!peer.is_sender);
        assert!(net.node(alice_addr()).stats().handshakes_completed > completed);

        let now = net.now;
        assert!(matches!(
            net.node(alice_addr()).send(bob_addr(), &json!(["post", "after idle"]), now),
            Ok(Delivery::Sent(1))
        ));
        net.run(2);
        assert!(net.node(bob_addr()).drain_events().iter().any(|e| matches!(
            e,
            NodeEvent::Message { payload, .. } if *payload == json!(["post", "after idle"])
        )));
    }

    #[test]
    fn test_tracker_session_recovers() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        net.connect();
        let config = net.node(alice_addr()).config().clone();

        // alice → 트래커 경로가 끊겨 트래커가 alice를 잊음
        net.drop_link = Some((alice_addr(), tracker_addr(), 0));
        net.run(rounds(config.last_access_limit + config.poll_interval));
        assert_eq!(net.tracker.client_count(), 1);
        assert!(!net.node(alice_addr()).tracker(&tracker_addr()).unwrap().connected);
        assert!(net
            .node(alice_addr())
            .drain_events()
            .iter()
            .any(|e| matches!(e, NodeEvent::TrackerFailure { .. })));

        net.drop_link = None;
        let reconnected = net.run_until(rounds(config.poll_interval * 2), |net| {
            net.node(alice_addr()).tracker(&tracker_addr()).unwrap().connected
        });
        assert!(reconnected);
        assert_eq!(net.tracker.client_count(), 2);

        // 다시 등록되어 announce가 통함
        net.establish(alice_addr(), bob_addr());
    }

    #[test]
    fn test_end_marker_retry_bound() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        net.connect();
        net.establish(alice_addr(), bob_addr());

        let mtu = net.node(alice_addr()).config().mtu;
        let max_trial = net.node(alice_addr()).config().max_trial as usize;
        let data = vec![3u8; mtu * 2 + 5];
        let key = catalog_media(&net, bob_addr(), &data);

        // READY와 청크 ACK 3개만 통과, 최종 결과는 유실
        net.drop_link = Some((bob_addr(), alice_addr(), 4));
        let before = net.sent(alice_addr(), bob_addr());
        let now = net.now;
        let mut rx = net.node(alice_addr()).send_media(
            bob_addr(),
            "alice",
            1,
            "0",
            Bytes::from(data),
            now,
        );

        assert_eq!(net.wait_media(&mut rx), Some(MediaCode::TimedOut));
        // 요청 + 청크 3개 + 종료 마커 (첫 전송 + 재전송 MAX_TRIAL) + 취소
        assert_eq!(
            net.sent(alice_addr(), bob_addr()) - before,
            1 + 3 + (1 + max_trial) + 1
        );
        assert_eq!(net.node(alice_addr()).stats().media_chunks_sent, 3);
        assert!(net.node(alice_addr()).peer(&bob_addr()).unwrap().media.is_none());

        // 수신측은 검증 후 이미 저장
        assert!(net.test_node(bob_addr()).storage.exists(&key));
    }

    #[test]
    fn test_retried_end_marker_answered_again() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        net.connect();
        net.establish(alice_addr(), bob_addr());

        let mtu = net.node(alice_addr()).config().mtu;
        let data = vec![9u8; mtu * 2 + 5];
        catalog_media(&net, bob_addr(), &data);

        net.drop_link = Some((bob_addr(), alice_addr(), 4));
        let before = net.sent(alice_addr(), bob_addr());
        let now = net.now;
        let mut rx = net.node(alice_addr()).send_media(
            bob_addr(),
            "alice",
            1,
            "0",
            Bytes::from(data),
            now,
        );

        // 종료 마커가 한 번 재전송될 때까지 결과 유실
        let retried = net.run_until(100, |net| {
            net.sent(alice_addr(), bob_addr()) - before >= 1 + 3 + 2
        });
        assert!(retried);

        net.drop_link = None;
        assert_eq!(net.wait_media(&mut rx), Some(MediaCode::Accepted));
        assert_eq!(net.node(bob_addr()).stats().media_received, 1);
        assert_eq!(net.node(alice_addr()).stats().media_sent, 1);
    }

    #[test]
    fn test_duplicate_chunk_acked_again() {
        let mut net = Net::new(&[alice_addr(), bob_addr()]);
        net.connect();
        net.establish(alice_addr(), bob_addr());

        let mtu = net.node(alice_addr()).config().mtu;
        let data: Vec<u8> = (0..mtu * 3 + 17).map(|i| (i % 241) as u8).collect();
        let key = catalog_media(&net, bob_addr(), &data);

        // READY와 첫 ACK만 통과
        net.drop_link = Some((bob_addr(), alice_addr(), 2));
        let now = net.now;
        let mut rx = net.node(alice_addr()).send_media(
            bob_addr(),
            "alice",
            1,
            "0",
            Bytes::from(data.clone()),
            now,
        );

        // 두 번째 청크 재전송: 수신측은 중복으로 보고 세지 않음
        let resent = net.run_until(100, |net| {
            net.node(alice_addr()).stats().media_chunks_sent >= 3
        });
        assert!(resent);
        assert_eq!(net.node(bob_addr()).stats().media_chunks_received, 2);

        net.drop_link = None;
        assert_eq!(net.wait_media(&mut rx), Some(MediaCode::Accepted));
        assert_eq!(net.node(bob_addr()).stats().media_chunks_received, 4);
        assert!(net.node(alice_addr()).stats().media_chunks_sent > 4);

        let stored = net.test_node(bob_addr()).storage.read(&key).unwrap();
        assert_eq!(stored.as_ref(), data.as_slice());
    }

    fn media_requests(node: &mut Node, to: SocketAddr, cipher: &SessionCipher) -> usize {
        node.take_outbox()
            .drain()
            .into_iter()
            .filter(|(addr, _)| *addr == to)
            .filter_map(|(_, data)| decode_frame(&cipher.decrypt(&data).ok()?))
            .filter(|frame| {
                matches!(
                    frame,
                    Frame::Message(value)
                        if matches!(PeerMessage::parse(value.clone()), Some(PeerMessage::MediaRequest(_)))
                )
            })
            .count()
    }

    #[test]
    fn test_media_retried_before_confirmation() {
        let start = Instant::now();
        let mut node = standalone(start);
        let config = node.config().clone();
        let initiator: SocketAddr = "198.51.100.26:5000".parse().unwrap();
        let (offered, cipher) = offer_session(&node.public_key()).unwrap();
        node.handle_datagram(initiator, &offered, start);
        assert!(matches!(node.peer(&initiator).unwrap().link, Link::Accepted { .. }));
        node.take_outbox();

        // 상대의 첫 메시지가 오기 전에 전송 시작
        let sent_at = start + STEP;
        let mut rx = node.send_media(
            initiator,
            "alice",
            1,
            "0",
            Bytes::from_static(b"picture"),
            sent_at,
        );
        assert_eq!(media_requests(&mut node, initiator, &cipher), 1);

        node.on_tick(sent_at + config.ack_timeout);
        assert_eq!(media_requests(&mut node, initiator, &cipher), 1);

        for i in 2..=config.max_trial + 1 {
            node.on_tick(sent_at + config.ack_timeout * i);
        }
        assert_eq!(rx.try_recv(), Ok(MediaCode::TimedOut));
        assert!(node.peer(&initiator).unwrap().media.is_none());
    }
}
