//! 노드 설정
//!
//! - `Config`: 프로토콜 동작 상수 (재시도, MTU, 타이머)
//! - `NodeConfig`: 바인드 주소, 데이터 디렉터리, 부트스트랩 파일 경로
//! - `Bootstrap`: 영속화된 트래커/피어 목록 (시작 시 1회 로드)

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::{decode_public_key, PublicKeyBytes};
use crate::message::validate_address;
use crate::{Error, Result, DEFAULT_BROADCAST_AMOUNT, DEFAULT_MAX_TRIAL, DEFAULT_MTU};

/// 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 최대 시도 횟수 (핸드쉐이크, 재전송, 피어 quality 초기값)
    pub max_trial: u32,

    /// 데이터그램당 최대 애플리케이션 페이로드 (바이트)
    pub mtu: usize,

    /// 수신 데이터그램 절대 상한 (바이트)
    pub max_payload: usize,

    /// 같은 피어의 메시지 최소 간격
    pub access_cooldown: Duration,

    /// 이 시간 이상 조용한 피어는 불량으로 취급
    pub last_access_limit: Duration,

    /// 기본 브로드캐스트 팬아웃
    pub broadcast_amount: usize,

    /// 핸드쉐이크 재시도 간격
    pub handshake_interval: Duration,

    /// 트래커 keep-alive 간격
    pub keep_alive_interval: Duration,

    /// 생존 확인 주기
    pub poll_interval: Duration,

    /// 미디어 ACK 대기 타임아웃
    pub ack_timeout: Duration,

    /// 스케줄러 틱 간격
    pub tick_interval: Duration,

    /// 수신 미디어 최대 크기 (바이트)
    pub max_media_size: u64,

    /// 트래커 측 announce 유효 틱 수
    pub announce_ttl: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_trial: DEFAULT_MAX_TRIAL,
            mtu: DEFAULT_MTU,
            max_payload: 2048,
            access_cooldown: Duration::from_millis(20),
            last_access_limit: Duration::from_secs(60),
            broadcast_amount: DEFAULT_BROADCAST_AMOUNT,
            handshake_interval: Duration::from_secs(1),
            keep_alive_interval: Duration::from_secs(6),
            poll_interval: Duration::from_secs(10),
            ack_timeout: Duration::from_millis(500),
            tick_interval: Duration::from_millis(100),
            max_media_size: 16 * 1024 * 1024, // 16MB
            announce_ttl: 30,
        }
    }
}

impl Config {
    /// 바이트 수에 필요한 미디어 청크 수
    pub fn chunks_for(&self, len: u64) -> u64 {
        len.div_ceil(self.mtu as u64)
    }

    /// 수신측 전송 유휴 한도
    pub fn inbound_idle_limit(&self) -> Duration {
        self.ack_timeout * (self.max_trial + 2)
    }

    /// LAN / 테스트용 설정 (짧은 타이머)
    pub fn lan() -> Self {
        Self {
            access_cooldown: Duration::from_millis(5),
            last_access_limit: Duration::from_secs(20),
            handshake_interval: Duration::from_millis(300),
            keep_alive_interval: Duration::from_secs(3),
            poll_interval: Duration::from_secs(5),
            ack_timeout: Duration::from_millis(150),
            tick_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            max_trial: 8,
            mtu: 1000, // 작은 청크
            last_access_limit: Duration::from_secs(120),
            handshake_interval: Duration::from_millis(1500),
            ack_timeout: Duration::from_secs(1),
            announce_ttl: 60,
            ..Self::default()
        }
    }
}

/// 노드 실행 설정 (파일 → 환경변수 → CLI 순으로 덮어씀)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// UDP 바인드 주소
    pub bind: SocketAddr,

    /// 저장소 루트
    pub data_dir: PathBuf,

    /// 트래커 목록 파일 (JSON)
    pub trackers_file: PathBuf,

    /// 알려진 피어 목록 파일 (JSON, 선택)
    pub peers_file: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 40001)),
            data_dir: PathBuf::from("data"),
            trackers_file: PathBuf::from("trackers.json"),
            peers_file: PathBuf::from("peers.json"),
        }
    }
}

impl NodeConfig {
    /// 설정 로드: 기본값, 설정 파일(있으면), 환경변수 순
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                serde_json::from_str(&text)?
            }
            _ => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(s) = std::env::var("DSN_BIND") {
            self.bind = s
                .parse()
                .map_err(|_| Error::Config(format!("DSN_BIND: {}", s)))?;
        }
        if let Some(dir) = std::env::var_os("DSN_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = std::env::var_os("DSN_TRACKERS") {
            self.trackers_file = PathBuf::from(file);
        }
        if let Some(file) = std::env::var_os("DSN_PEERS") {
            self.peers_file = PathBuf::from(file);
        }
        Ok(())
    }
}

/// 영속화된 원격 엔드포인트 항목
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointEntry {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl EndpointEntry {
    /// 주소 검증
    pub fn address(&self) -> Option<SocketAddr> {
        let addr = SocketAddr::new(self.ip, self.port);
        validate_address(addr).then_some(addr)
    }

    /// 공개키 디코딩
    pub fn key(&self) -> Option<PublicKeyBytes> {
        self.public_key.as_deref().and_then(decode_public_key)
    }
}

/// 시작 시 로드하는 트래커/피어 목록
#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    /// (주소, 공개키)
    pub trackers: Vec<(SocketAddr, PublicKeyBytes)>,

    /// (주소, 공개키(알려진 경우))
    pub peers: Vec<(SocketAddr, Option<PublicKeyBytes>)>,
}

impl Bootstrap {
    /// 파일에서 로드. 유효한 트래커가 없으면 치명적 에러
    pub fn load(trackers_file: &Path, peers_file: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(trackers_file).map_err(|e| {
            Error::Config(format!("트래커 목록 읽기 실패 {:?}: {}", trackers_file, e))
        })?;
        let trackers: Vec<EndpointEntry> = serde_json::from_str(&text)?;

        let peers: Vec<EndpointEntry> = if peers_file.exists() {
            serde_json::from_str(&std::fs::read_to_string(peers_file)?)?
        } else {
            Vec::new()
        };

        Self::from_entries(&trackers, &peers)
    }

    /// 항목 검증 후 구성
    pub fn from_entries(trackers: &[EndpointEntry], peers: &[EndpointEntry]) -> Result<Self> {
        let mut bootstrap = Self::default();

        for entry in trackers {
            match (entry.address(), entry.key()) {
                (Some(addr), Some(key)) => bootstrap.trackers.push((addr, key)),
                _ => warn!("유효하지 않은 트래커 항목 무시: {}:{}", entry.ip, entry.port),
            }
        }

        for entry in peers {
            match entry.address() {
                Some(addr) => bootstrap.peers.push((addr, entry.key())),
                None => warn!("유효하지 않은 피어 항목 무시: {}:{}", entry.ip, entry.port),
            }
        }

        if bootstrap.trackers.is_empty() {
            return Err(Error::NoTrackers);
        }
        Ok(bootstrap)
    }
}
