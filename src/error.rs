//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

use crate::crypto::CryptoError;

/// DSN 노드 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("트래커 없음: 최소 하나의 유효한 트래커가 필요함")]
    NoTrackers,

    #[error("페이로드 크기 초과: {size} > {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("유효하지 않은 페이로드: JSON 배열 또는 객체만 허용")]
    InvalidPayload,

    #[error("유효하지 않은 대상: {0}")]
    InvalidTarget(SocketAddr),

    #[error("연결 실패: {attempts}회 시도")]
    ConnectFailed { attempts: u32 },

    #[error("유효하지 않은 공개키: {0}")]
    InvalidPublicKey(String),

    #[error("유효하지 않은 저장소 키: {0}")]
    InvalidKey(String),

    #[error("저장소 항목 없음: {0}")]
    NotFound(String),

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("채널 에러")]
    ChannelError,

    #[error("노드 종료")]
    Stopped,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
