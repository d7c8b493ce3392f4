//! 암호화 모듈 - X25519 키 교환 + ChaCha20-Poly1305 대칭 암호화
//!
//! 흐름:
//! 1. 노드는 장기 키쌍(StaticSecret)을 가지며 공개키를 트래커에 등록 (setPub)
//! 2. 연결 시작측은 피어마다 임시 키쌍을 생성, 공개키만 원시 데이터그램으로 전송
//! 3. 양측이 공유 비밀 계산 후 SHA-256으로 세션 키 유도
//! 4. 이후 모든 데이터그램은 nonce(12) + ChaCha20-Poly1305 암호문

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{Rng, RngCore};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

/// X25519 공개키 (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 디코이 버퍼 길이 범위 (핸드쉐이크 크기와 겹치지 않음)
const DECOY_LEN: std::ops::RangeInclusive<usize> = 40..=120;

/// 세션 키 유도 도메인 구분자
const SESSION_CONTEXT: &[u8] = b"dsn-session-v1";

/// 공개키 바이트
pub type PublicKeyBytes = [u8; PUBLIC_KEY_SIZE];

/// 콘텐츠 해시 (SHA-256)
pub type ContentHash = [u8; 32];

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("키 교환 실패")]
    KeyExchangeFailed,
    #[error("암호화 실패: {0}")]
    EncryptionFailed(String),
    #[error("복호화 실패: {0}")]
    DecryptionFailed(String),
    #[error("잘못된 키 크기")]
    InvalidKeySize,
}

/// 노드 장기 키쌍
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// 새 키쌍 생성
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// 저장된 비밀키로 복원
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// 비밀키 바이트 (영속화용)
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// 공개키를 바이트로 변환
    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        *self.public.as_bytes()
    }

    /// 상대방 임시 공개키로 세션 키 계산
    ///
    /// 기여하지 않는(저차수) 공개키면 None
    pub fn session_key(&self, peer_public: &PublicKeyBytes) -> Option<[u8; 32]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        contributory_session_key(shared)
    }
}

/// 임시 키쌍 (핸드쉐이크 1회용)
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// 새 임시 키쌍 생성
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// 공개키를 바이트로 변환
    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        *self.public.as_bytes()
    }

    /// 상대방 장기 공개키로 세션 키 계산 (소비됨)
    pub fn session_key(self, peer_public: &PublicKeyBytes) -> Option<[u8; 32]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        contributory_session_key(shared)
    }
}

fn contributory_session_key(shared: SharedSecret) -> Option<[u8; 32]> {
    if !shared.was_contributory() {
        return None;
    }
    Some(derive_session_key(shared.as_bytes()))
}

/// 공유 비밀에서 32바이트 세션 키 유도
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SESSION_CONTEXT);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// 임시 키쌍을 만들고 즉시 세션을 유도
///
/// 반환: (보낼 공개키, 세션 암호화기)
pub fn offer_session(remote_public: &PublicKeyBytes) -> Option<(PublicKeyBytes, SessionCipher)> {
    let keypair = EphemeralKeyPair::generate();
    let local_public = keypair.public_key_bytes();
    let key = keypair.session_key(remote_public)?;
    Some((local_public, SessionCipher::new(&key)))
}

/// 데이터그램 암호화기 (피어별 세션)
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
}

impl SessionCipher {
    /// 세션 키로 암호화기 생성
    pub fn new(session_key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(session_key)),
        }
    }

    /// 암호화
    /// 반환: nonce(12) + ciphertext(원본 + 16바이트 태그)
    ///
    /// UDP는 순서가 없으므로 nonce는 카운터 대신 무작위
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// 복호화
    /// 입력: nonce(12) + ciphertext
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if encrypted.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("데이터가 너무 짧음".into()));
        }

        let nonce = Nonce::from_slice(&encrypted[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &encrypted[NONCE_SIZE..])
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

/// SHA-256 콘텐츠 해시
pub fn hash_content(data: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 무작위 길이의 디코이 버퍼 (프로토콜 탐색 방지 / 홀펀칭 보조)
pub fn decoy() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; rng.gen_range(DECOY_LEN)];
    rng.fill_bytes(&mut buf);
    buf
}

/// 16진 문자열 공개키 디코딩
pub fn decode_public_key(text: &str) -> Option<PublicKeyBytes> {
    let bytes = hex::decode(text.trim()).ok()?;
    bytes.try_into().ok()
}

/// 공개키 16진 인코딩
pub fn encode_public_key(key: &PublicKeyBytes) -> String {
    hex::encode(key)
}
