//! # DSN (Distributed Social Node)
//!
//! 탈중앙 소셜 네트워크 노드의 UDP 피어 통신 코어
//!
//! ## 핵심 특징
//! - **피어별 암호 세션**: X25519 키 교환 + ChaCha20-Poly1305
//! - **트래커 랑데부**: NAT 뒤 피어끼리 트래커 중개로 핸드쉐이크
//! - **가십 브로드캐스트**: 계정별 시더 목록에서 결정적으로 대상 선택
//! - **미디어 전송**: 청크 단위 stop-and-wait ACK + 해시 검증
//! - **단일 소유 상태**: 모든 프로토콜 상태는 하나의 태스크가 소유

pub mod config;
pub mod crypto;
pub mod error;
pub mod gossip;
pub mod media;
pub mod message;
pub mod node;
pub mod peer;
pub mod receiver;
pub mod registry;
pub mod rendezvous;
pub mod stats;
pub mod storage;
pub mod tracker;
pub mod transport;

pub use config::{Bootstrap, Config, NodeConfig};
pub use crypto::{KeyPair, PublicKeyBytes, SessionCipher};
pub use error::{Error, Result};
pub use media::{MediaCatalog, MediaSlot, MemoryCatalog};
pub use message::{MediaCode, MediaRequest, PeerMessage, TrackerCommand, TrackerRequest};
pub use node::{Delivery, Node, NodeEvent};
pub use peer::PeerInfo;
pub use receiver::{EventReceiver, Receiver};
pub use rendezvous::TrackerServer;
pub use stats::NodeStats;
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use transport::{Outbox, Transport};

/// 기본 최대 시도 횟수
pub const DEFAULT_MAX_TRIAL: u32 = 5;

/// 기본 데이터그램 페이로드 한도 (바이트)
pub const DEFAULT_MTU: usize = 1200;

/// 기본 브로드캐스트 팬아웃
pub const DEFAULT_BROADCAST_AMOUNT: usize = 4;
