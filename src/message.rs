//! 프로토콜 메시지 정의
//!
//! 복호화된 평문은 두 종류:
//! - UTF-8 JSON 배열/객체 (애플리케이션 및 제어 메시지)
//! - 태그된 바이너리 미디어 청크 (seq(2, BE) + 데이터)
//!
//! JSON 디코딩을 먼저 시도하고 실패하면 미디어 청크로 해석

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use rand::{Rng, RngCore};
use serde_json::{json, Value};

use crate::crypto::{decode_public_key, encode_public_key, PublicKeyBytes};

/// 핸드쉐이크 확인
pub const CMD_HANDSHAKE: &str = "handshake";

/// 미디어 전송 요청
pub const CMD_MEDIA: &str = "media";

/// 미디어 제어 코드 응답
pub const CMD_MEDIA_STATUS: &str = "media_status";

/// 스트림 종료 마커
pub const END_MARKER: u16 = 0xFFFF;

/// 전송 취소 마커
pub const CANCEL_MARKER: u16 = 0xFFFE;

/// 전송당 최대 데이터 청크 수 (마커 제외 u16 공간)
pub const MAX_MEDIA_CHUNKS: u32 = CANCEL_MARKER as u32;

/// 계정 식별자 최대 길이
const MAX_ACCOUNT_LEN: usize = 256;

/// 미디어 제어 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaCode {
    NotReady = 0,
    InfoInvalid = 1,
    PostNotFound = 2,
    NoMedia = 3,
    /// 이미 로컬에 있음
    MediaFound = 4,
    FileNotFound = 5,
    FileNotReady = 6,
    FileTooLarge = 7,
    Ready = 8,
    PeerErr = 9,
    TimedOut = 10,
    Declined = 11,
    Accepted = 12,
    Ack = 13,
}

impl MediaCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        use MediaCode::*;
        Some(match code {
            0 => NotReady,
            1 => InfoInvalid,
            2 => PostNotFound,
            3 => NoMedia,
            4 => MediaFound,
            5 => FileNotFound,
            6 => FileNotReady,
            7 => FileTooLarge,
            8 => Ready,
            9 => PeerErr,
            10 => TimedOut,
            11 => Declined,
            12 => Accepted,
            13 => Ack,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// 미디어 전송 요청: `["media", owner, index, selector, totalChunks]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    /// 게시물 소유 계정
    pub owner: String,

    /// 게시물 인덱스
    pub index: u64,

    /// 게시물 내 미디어 선택자
    pub selector: String,

    /// 전송할 데이터 청크 수
    pub total_chunks: u32,
}

impl MediaRequest {
    fn from_values(values: &[Value]) -> Option<Self> {
        let owner = values.first()?.as_str().filter(|s| valid_account(s))?;
        let index = values.get(1)?.as_u64()?;
        let selector = match values.get(2)? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let total_chunks = u32::try_from(values.get(3)?.as_u64()?).ok()?;

        Some(Self {
            owner: owner.to_string(),
            index,
            selector,
            total_chunks,
        })
    }

    pub fn to_value(&self) -> Value {
        json!([
            CMD_MEDIA,
            self.owner,
            self.index,
            self.selector,
            self.total_chunks
        ])
    }
}

/// 피어 간 메시지
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// 핸드쉐이크 확인
    Handshake,

    /// 미디어 전송 요청
    MediaRequest(MediaRequest),

    /// 미디어 제어 코드 (ACK이면 seq 포함)
    MediaStatus { code: MediaCode, seq: Option<u16> },

    /// 애플리케이션 페이로드 (콜백으로 그대로 전달)
    Application(Value),
}

impl PeerMessage {
    /// JSON 값 해석. 프로토콜 명령인데 형식이 틀리면 None
    pub fn parse(value: Value) -> Option<Self> {
        let protocol = value.as_array().and_then(|items| {
            match items.first().and_then(Value::as_str) {
                Some(CMD_HANDSHAKE) => Some(Some(PeerMessage::Handshake)),
                Some(CMD_MEDIA) => {
                    Some(MediaRequest::from_values(&items[1..]).map(PeerMessage::MediaRequest))
                }
                Some(CMD_MEDIA_STATUS) => Some(parse_status(&items[1..])),
                _ => None,
            }
        });

        match protocol {
            Some(message) => message,
            None => Some(PeerMessage::Application(value)),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PeerMessage::Handshake => json!([CMD_HANDSHAKE]),
            PeerMessage::MediaRequest(request) => request.to_value(),
            PeerMessage::MediaStatus { code, seq: Some(seq) } => {
                json!([CMD_MEDIA_STATUS, code.as_u8(), seq])
            }
            PeerMessage::MediaStatus { code, seq: None } => json!([CMD_MEDIA_STATUS, code.as_u8()]),
            PeerMessage::Application(value) => value.clone(),
        }
    }

    pub fn status(code: MediaCode) -> Self {
        PeerMessage::MediaStatus { code, seq: None }
    }

    pub fn ack(seq: u16) -> Self {
        PeerMessage::MediaStatus {
            code: MediaCode::Ack,
            seq: Some(seq),
        }
    }
}

fn parse_status(values: &[Value]) -> Option<PeerMessage> {
    let code = u8::try_from(values.first()?.as_u64()?).ok()?;
    let code = MediaCode::from_u8(code)?;
    let seq = match values.get(1) {
        Some(v) => Some(u16::try_from(v.as_u64()?).ok()?),
        None => None,
    };
    Some(PeerMessage::MediaStatus { code, seq })
}

/// 바이너리 미디어 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaFrame {
    Data { seq: u16, payload: Bytes },
    End,
    Cancel,
}

impl MediaFrame {
    /// 바이트로 직렬화. 마커는 무작위 패딩(16~64바이트)을 붙임
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MediaFrame::Data { seq, payload } => {
                let mut buf = Vec::with_capacity(2 + payload.len());
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            MediaFrame::End => padded_marker(END_MARKER),
            MediaFrame::Cancel => padded_marker(CANCEL_MARKER),
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }
        match u16::from_be_bytes([bytes[0], bytes[1]]) {
            END_MARKER => Some(MediaFrame::End),
            CANCEL_MARKER => Some(MediaFrame::Cancel),
            seq => Some(MediaFrame::Data {
                seq,
                payload: Bytes::copy_from_slice(&bytes[2..]),
            }),
        }
    }
}

fn padded_marker(marker: u16) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; 2 + rng.gen_range(16..=64)];
    rng.fill_bytes(&mut buf[2..]);
    buf[..2].copy_from_slice(&marker.to_be_bytes());
    buf
}

/// 복호화된 평문 프레임
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Value),
    Media(MediaFrame),
}

/// 평문 해석: JSON 배열/객체 우선, 아니면 미디어 청크
pub fn decode_frame(plain: &[u8]) -> Option<Frame> {
    if let Ok(value) = serde_json::from_slice::<Value>(plain) {
        if value.is_array() || value.is_object() {
            return Some(Frame::Message(value));
        }
    }
    MediaFrame::decode(plain).map(Frame::Media)
}

/// 트래커 → 노드 명령
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCommand {
    /// 외부에서 관측된 내 주소
    Welcome(SocketAddr),

    /// 트래커가 모르는 대상
    Unknown(SocketAddr),

    /// 대상의 실제 주소와 공개키
    SendPub {
        addr: SocketAddr,
        public_key: PublicKeyBytes,
    },

    /// 홀펀칭 보조용 디코이 요청
    SendRand(SocketAddr),

    /// 계정의 시더 목록
    Seeder {
        account: String,
        peers: Vec<SocketAddr>,
    },

    Seeding { account: String, addr: SocketAddr },

    Unseeding { account: String, addr: SocketAddr },
}

impl TrackerCommand {
    /// 형식/주소 검증 실패 시 None (무시)
    pub fn parse(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let args = items.get(1..).unwrap_or_default();
        Some(match items.first()?.as_str()? {
            "welcome" => TrackerCommand::Welcome(parse_address(args.first()?, args.get(1)?)?),
            "unknown" => TrackerCommand::Unknown(parse_address(args.first()?, args.get(1)?)?),
            "sendpub" => TrackerCommand::SendPub {
                addr: parse_address(args.first()?, args.get(1)?)?,
                public_key: decode_public_key(args.get(2)?.as_str()?)?,
            },
            "sendrand" => TrackerCommand::SendRand(parse_address(args.first()?, args.get(1)?)?),
            "seeder" => TrackerCommand::Seeder {
                account: parse_account(args.first()?)?,
                peers: args
                    .get(1)?
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_str().and_then(address_from_str))
                    .collect(),
            },
            "seeding" => TrackerCommand::Seeding {
                account: parse_account(args.first()?)?,
                addr: address_from_str(args.get(1)?.as_str()?)?,
            },
            "unseeding" => TrackerCommand::Unseeding {
                account: parse_account(args.first()?)?,
                addr: address_from_str(args.get(1)?.as_str()?)?,
            },
            _ => return None,
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            TrackerCommand::Welcome(addr) => json!(["welcome", addr.ip().to_string(), addr.port()]),
            TrackerCommand::Unknown(addr) => json!(["unknown", addr.ip().to_string(), addr.port()]),
            TrackerCommand::SendPub { addr, public_key } => json!([
                "sendpub",
                addr.ip().to_string(),
                addr.port(),
                encode_public_key(public_key)
            ]),
            TrackerCommand::SendRand(addr) => {
                json!(["sendrand", addr.ip().to_string(), addr.port()])
            }
            TrackerCommand::Seeder { account, peers } => {
                let peers: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
                json!(["seeder", account, peers])
            }
            TrackerCommand::Seeding { account, addr } => {
                json!(["seeding", account, addr.to_string()])
            }
            TrackerCommand::Unseeding { account, addr } => {
                json!(["unseeding", account, addr.to_string()])
            }
        }
    }
}

/// 노드 → 트래커 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerRequest {
    /// 랑데부 세션 공개키 등록
    SetPub(PublicKeyBytes),

    /// 대상 피어로의 연결 요청
    Announce(SocketAddr),

    Seed(String),

    Unseed(String),
}

impl TrackerRequest {
    pub fn parse(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let args = items.get(1..).unwrap_or_default();
        Some(match items.first()?.as_str()? {
            "setPub" => TrackerRequest::SetPub(decode_public_key(args.first()?.as_str()?)?),
            "announce" => TrackerRequest::Announce(parse_address(args.first()?, args.get(1)?)?),
            "seed" => TrackerRequest::Seed(parse_account(args.first()?)?),
            "unseed" => TrackerRequest::Unseed(parse_account(args.first()?)?),
            _ => return None,
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            TrackerRequest::SetPub(key) => json!(["setPub", encode_public_key(key)]),
            TrackerRequest::Announce(addr) => {
                json!(["announce", addr.ip().to_string(), addr.port()])
            }
            TrackerRequest::Seed(account) => json!(["seed", account]),
            TrackerRequest::Unseed(account) => json!(["unseed", account]),
        }
    }
}

/// 주소 형식 검증: 포트 1~65535, 지정되지 않음/멀티캐스트/브로드캐스트 제외
pub fn validate_address(addr: SocketAddr) -> bool {
    if addr.port() == 0 {
        return false;
    }
    match addr.ip() {
        IpAddr::V4(ip) => !(ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast()),
        IpAddr::V6(ip) => !(ip.is_unspecified() || ip.is_multicast()),
    }
}

/// `[ip, port]` JSON 쌍에서 주소 해석
pub fn parse_address(ip: &Value, port: &Value) -> Option<SocketAddr> {
    let ip: IpAddr = ip.as_str()?.parse().ok()?;
    let port = u16::try_from(port.as_u64()?).ok()?;
    let addr = SocketAddr::new(ip, port);
    validate_address(addr).then_some(addr)
}

/// `"ip:port"` 문자열에서 주소 해석
pub fn address_from_str(text: &str) -> Option<SocketAddr> {
    let addr: SocketAddr = text.parse().ok()?;
    validate_address(addr).then_some(addr)
}

fn valid_account(account: &str) -> bool {
    !account.is_empty() && account.len() <= MAX_ACCOUNT_LEN
}

fn parse_account(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| valid_account(s))
        .map(str::to_string)
}
