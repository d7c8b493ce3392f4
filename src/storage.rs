//! 저장소 협력자 (key → blob)
//!
//! 노드 코어는 `Storage` 트레이트만 호출한다.
//! - `FsStorage`: 루트 디렉터리 아래 파일 (동기 + tokio::fs 비동기 변형)
//! - `MemoryStorage`: 프로세스 메모리 (테스트, 임베딩용)

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::crypto::KeyPair;
use crate::{Error, Result};

/// 노드 장기 비밀키 저장 키
pub const IDENTITY_KEY: &str = "identity.key";

/// key → blob 저장소
pub trait Storage: Send + Sync {
    /// 키 존재 여부
    fn exists(&self, key: &str) -> bool;

    /// 읽기
    fn read(&self, key: &str) -> Result<Bytes>;

    /// 쓰기 (덮어씀)
    fn write(&self, key: &str, data: &[u8]) -> Result<()>;
}

/// 이벤트 루프를 막지 않는 읽기 (blocking 풀에서 실행)
pub async fn read_async(storage: Arc<dyn Storage>, key: String) -> Result<Bytes> {
    tokio::task::spawn_blocking(move || storage.read(&key))
        .await
        .map_err(|_| Error::ChannelError)?
}

/// 키 검증: 상대 경로, `..`/루트 탈출 금지
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.to_string()))
    }
}

/// 파일 시스템 저장소
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// 루트 디렉터리 생성 후 저장소 반환
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// 비동기 존재 확인
    pub async fn exists_async(&self, key: &str) -> bool {
        match self.path(key) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// 비동기 읽기
    pub async fn read_async(&self, key: &str) -> Result<Bytes> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 비동기 쓰기
    pub async fn write_async(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}

impl Storage for FsStorage {
    fn exists(&self, key: &str) -> bool {
        self.path(key).map(|p| p.is_file()).unwrap_or(false)
    }

    fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.path(key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        debug!("저장: {} ({} bytes)", key, data.len());
        Ok(())
    }
}

/// 메모리 저장소
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn exists(&self, key: &str) -> bool {
        self.blobs.read().contains_key(key)
    }

    fn read(&self, key: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.blobs
            .write()
            .insert(key.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }
}

/// 노드 장기 키 로드 (없으면 생성 후 저장)
pub fn load_or_create_identity(storage: &dyn Storage) -> Result<KeyPair> {
    if storage.exists(IDENTITY_KEY) {
        let text = storage.read(IDENTITY_KEY)?;
        let bytes = hex::decode(text.trim_ascii())
            .map_err(|e| Error::InvalidPublicKey(format!("{}: {}", IDENTITY_KEY, e)))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidPublicKey(IDENTITY_KEY.to_string()))?;
        return Ok(KeyPair::from_secret_bytes(secret));
    }

    let keypair = KeyPair::generate();
    storage.write(IDENTITY_KEY, hex::encode(keypair.secret_bytes()).as_bytes())?;
    info!("새 노드 키 생성: {}", hex::encode(keypair.public_key_bytes()));
    Ok(keypair)
}
