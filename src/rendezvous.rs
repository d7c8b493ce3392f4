//! 트래커 서버 엔진 (랑데부 + 시더 목록)
//!
//! 노드와 같은 방식으로 소켓 없이 동작한다. 데이터그램과 틱을 넣으면
//! 보낼 데이터그램이 `Outbox`에 쌓인다.
//!
//! - 32바이트 데이터그램: 노드의 임시 공개키. 상태 없이 세션을 만들고 `welcome`
//! - 빈 데이터그램: keep-alive. 접속 중인 노드에게만 `welcome`으로 응답
//! - `setPub`: 노드의 장기 공개키 등록 (다른 노드에게 `sendpub`으로 전달)
//! - `announce`: 대상이 등록되어 있으면 요청자에게 `sendpub`, 대상에게 `sendrand`
//! - `seed`/`unseed`: 계정별 시더 집합 관리, 다른 시더에게 변경 알림

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::{KeyPair, PublicKeyBytes, SessionCipher, PUBLIC_KEY_SIZE};
use crate::message::{validate_address, TrackerCommand, TrackerRequest};
use crate::transport::{Outbox, Transport, RECV_BUFFER_SIZE};

/// 트래커에 접속한 노드
struct Client {
    cipher: SessionCipher,
    /// `setPub`으로 등록한 장기 공개키
    public_key: Option<PublicKeyBytes>,
    last_access: Instant,
}

/// 대기 중인 연결 요청 (요청자 → 대상)
#[derive(Debug, Clone, PartialEq, Eq)]
struct Announcement {
    requester: SocketAddr,
    target: SocketAddr,
    /// 남은 틱 수
    ttl: u32,
}

/// 트래커 서버
pub struct TrackerServer {
    config: Config,
    keys: KeyPair,
    clients: HashMap<SocketAddr, Client>,
    announcements: Vec<Announcement>,
    seeders: HashMap<String, BTreeSet<SocketAddr>>,
    outbox: Outbox,
}

impl TrackerServer {
    pub fn new(config: Config, keys: KeyPair) -> Self {
        Self {
            config,
            keys,
            clients: HashMap::new(),
            announcements: Vec::new(),
            seeders: HashMap::new(),
            outbox: Outbox::new(),
        }
    }

    /// 노드들이 부트스트랩 목록에 넣을 공개키
    pub fn public_key(&self) -> PublicKeyBytes {
        self.keys.public_key_bytes()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn pending_announcements(&self) -> usize {
        self.announcements.len()
    }

    /// 계정 시더 (정렬됨)
    pub fn seeders(&self, account: &str) -> Vec<SocketAddr> {
        self.seeders
            .get(account)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn take_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }

    pub fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        if data.len() > self.config.max_payload || !validate_address(from) {
            return;
        }

        let opened = match self.clients.get_mut(&from) {
            // keep-alive: 세션이 살아 있음을 welcome으로 응답
            Some(client) if data.is_empty() => {
                client.last_access = now;
                self.send(from, &TrackerCommand::Welcome(from));
                return;
            }
            Some(client) => client.cipher.decrypt(data).ok().inspect(|_| {
                client.last_access = now;
            }),
            None => None,
        };

        match opened {
            Some(plain) => self.handle_request(from, &plain),
            None if data.len() == PUBLIC_KEY_SIZE => self.handle_handshake(from, data, now),
            None => debug!("해석할 수 없는 데이터그램 무시 ← {}", from),
        }
    }

    /// 임시 공개키로 세션 생성 후 외부 주소 통지
    fn handle_handshake(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let mut offered = [0u8; PUBLIC_KEY_SIZE];
        offered.copy_from_slice(data);

        let Some(session) = self.keys.session_key(&offered) else {
            debug!("핸드쉐이크 키 거부 ← {}", from);
            return;
        };

        // 재시도된 핸드쉐이크는 세션만 교체, 등록된 공개키는 유지
        let public_key = self.clients.get(&from).and_then(|c| c.public_key);
        self.clients.insert(
            from,
            Client {
                cipher: SessionCipher::new(&session),
                public_key,
                last_access: now,
            },
        );
        debug!("클라이언트 접속 {}", from);
        self.send(from, &TrackerCommand::Welcome(from));
    }

    fn handle_request(&mut self, from: SocketAddr, plain: &[u8]) {
        let request = serde_json::from_slice::<Value>(plain)
            .ok()
            .and_then(|value| TrackerRequest::parse(&value));

        match request {
            Some(TrackerRequest::SetPub(key)) => {
                if let Some(client) = self.clients.get_mut(&from) {
                    client.public_key = Some(key);
                    info!("공개키 등록 {}: {}", from, hex::encode(key));
                }
            }
            Some(TrackerRequest::Announce(target)) => self.on_announce(from, target),
            Some(TrackerRequest::Seed(account)) => self.on_seed(from, account),
            Some(TrackerRequest::Unseed(account)) => self.on_unseed(from, &account),
            None => warn!("잘못된 요청 무시 ← {}", from),
        }
    }

    fn on_announce(&mut self, requester: SocketAddr, target: SocketAddr) {
        let target_key = self.clients.get(&target).and_then(|c| c.public_key);
        let Some(target_key) = target_key.filter(|_| target != requester) else {
            debug!("announce 대상 모름 {} → {}", requester, target);
            self.send(requester, &TrackerCommand::Unknown(target));
            return;
        };

        if self
            .announcements
            .iter()
            .any(|a| a.requester == requester && a.target == target)
        {
            debug!("중복 announce 무시 {} → {}", requester, target);
            return;
        }

        // 상대도 이미 요청했으면 짝지어 정리
        let opposite = self
            .announcements
            .iter()
            .position(|a| a.requester == target && a.target == requester);
        match opposite {
            Some(index) => {
                self.announcements.swap_remove(index);
                debug!("announce 매칭 {} ↔ {}", requester, target);
            }
            None => self.announcements.push(Announcement {
                requester,
                target,
                ttl: self.config.announce_ttl,
            }),
        }

        self.send(target, &TrackerCommand::SendRand(requester));
        self.send(
            requester,
            &TrackerCommand::SendPub {
                addr: target,
                public_key: target_key,
            },
        );
    }

    fn on_seed(&mut self, from: SocketAddr, account: String) {
        let set = self.seeders.entry(account.clone()).or_default();
        let others: Vec<SocketAddr> = set.iter().copied().filter(|a| *a != from).collect();
        let added = set.insert(from);

        self.send(
            from,
            &TrackerCommand::Seeder {
                account: account.clone(),
                peers: others.clone(),
            },
        );
        if added {
            debug!("시더 추가 {}: {}", account, from);
            for seeder in others {
                self.send(
                    seeder,
                    &TrackerCommand::Seeding {
                        account: account.clone(),
                        addr: from,
                    },
                );
            }
        }
    }

    fn on_unseed(&mut self, from: SocketAddr, account: &str) {
        let Some(set) = self.seeders.get_mut(account) else {
            return;
        };
        if !set.remove(&from) {
            return;
        }
        let others: Vec<SocketAddr> = set.iter().copied().collect();
        if others.is_empty() {
            self.seeders.remove(account);
        }

        debug!("시더 제거 {}: {}", account, from);
        for seeder in others {
            self.send(
                seeder,
                &TrackerCommand::Unseeding {
                    account: account.to_string(),
                    addr: from,
                },
            );
        }
    }

    /// announce 만료, 조용한 클라이언트 정리
    pub fn on_tick(&mut self, now: Instant) {
        self.announcements.retain_mut(|a| {
            a.ttl = a.ttl.saturating_sub(1);
            a.ttl > 0
        });

        let limit = self.config.last_access_limit;
        let expired: Vec<SocketAddr> = self
            .clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_access) > limit)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in expired {
            info!("클라이언트 만료 {}", addr);
            self.clients.remove(&addr);
            self.announcements
                .retain(|a| a.requester != addr && a.target != addr);

            let accounts: Vec<String> = self
                .seeders
                .iter()
                .filter(|(_, set)| set.contains(&addr))
                .map(|(account, _)| account.clone())
                .collect();
            for account in accounts {
                self.on_unseed(addr, &account);
            }
        }
    }

    /// 소켓에 붙여 실행 (종료하지 않음)
    pub async fn serve(mut self, transport: Transport, tick_interval: Duration) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut ticker = tokio::time::interval(tick_interval);

        loop {
            tokio::select! {
                received = transport.recv(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(from, &buf[..len], Instant::now()),
                    Err(e) => debug!("수신 에러: {}", e),
                },
                _ = ticker.tick() => self.on_tick(Instant::now()),
            }

            let mut outbox = self.take_outbox();
            if !outbox.is_empty() {
                transport.flush(&mut outbox).await;
            }
        }
    }

    fn send(&mut self, to: SocketAddr, command: &TrackerCommand) {
        let Some(client) = self.clients.get(&to) else {
            return;
        };
        let sealed = serde_json::to_vec(&command.to_value())
            .ok()
            .and_then(|plain| client.cipher.encrypt(&plain).ok());
        match sealed {
            Some(data) => self.outbox.send(to, data),
            None => warn!("트래커 명령 암호화 실패 → {}", to),
        }
    }
}
