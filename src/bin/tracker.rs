//! DSN 트래커 - 랑데부 서버
//!
//! 노드의 외부 주소를 알려주고, 연결 요청(announce)을 중개하며
//! 계정별 시더 목록을 유지한다.
//!
//! 사용법:
//!   cargo run --release --bin dsn-tracker -- [OPTIONS]

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dsn::crypto::encode_public_key;
use dsn::storage::load_or_create_identity;
use dsn::{Config, FsStorage, TrackerServer, Transport};

/// 트래커 설정
struct TrackerOptions {
    bind: SocketAddr,
    data_dir: PathBuf,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 12345)),
            data_dir: PathBuf::from("tracker-data"),
        }
    }
}

fn parse_args() -> Result<TrackerOptions, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = TrackerOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                let text = args.get(i + 1).ok_or("--bind 값 필요")?;
                options.bind = text
                    .parse()
                    .map_err(|_| format!("유효한 주소 필요: {}", text))?;
                i += 1;
            }
            "--data" | "-d" => {
                let dir = args.get(i + 1).ok_or("--data 값 필요")?;
                options.data_dir = PathBuf::from(dir);
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"DSN Tracker - 랑데부 서버

- 노드 핸드쉐이크 수락, 외부 주소 통지 (welcome)
- announce 중개 (sendpub / sendrand)
- 계정별 시더 목록 (seeder / seeding / unseeding)

사용법:
  cargo run --release --bin dsn-tracker -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:12345)
  -d, --data <DIR>        신원 키 저장 위치 (기본: tracker-data)
  -h, --help              이 도움말 출력

시작 시 출력되는 공개키를 노드의 trackers.json 에 등록:
  [{{"ip": "1.2.3.4", "port": 12345, "publicKey": "<hex>"}}]
"#
                );
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    Ok(options)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = parse_args()?;
    let config = Config::default();

    let storage = FsStorage::new(&options.data_dir)?;
    let keys = load_or_create_identity(&storage)?;
    let transport = Transport::bind(options.bind).await?;

    let server = TrackerServer::new(config.clone(), keys);
    info!("=== DSN Tracker ===");
    info!("Bind: {}", transport.local_addr()?);
    info!("Public key: {}", encode_public_key(&server.public_key()));

    tokio::select! {
        _ = server.serve(transport, config.tick_interval) => {}
        _ = tokio::signal::ctrl_c() => info!("종료 신호 수신"),
    }

    Ok(())
}
