//! DSN 노드 - 탈중앙 소셜 네트워크 피어
//!
//! 트래커에 접속해 외부 주소를 얻고, 피어 메시지/미디어 이벤트를 로그로 출력
//!
//! 사용법:
//!   cargo run --release --bin dsn-node -- [OPTIONS]
//!
//! 예시:
//!   # 기본 설정 (trackers.json 필요)
//!   cargo run --release --bin dsn-node -- --data ./data
//!
//!   # 계정 시딩 + 피어에게 메시지 전송
//!   cargo run --release --bin dsn-node -- --seed alice --send 198.51.100.7:40001 '["post","hi"]'

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dsn::{Bootstrap, Config, FsStorage, MemoryCatalog, NodeConfig, NodeEvent, Receiver};

/// 실행 옵션
#[derive(Default)]
struct Options {
    config_file: Option<PathBuf>,
    bind: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
    trackers_file: Option<PathBuf>,
    peers_file: Option<PathBuf>,
    lan: bool,
    seed: Vec<String>,
    send: Vec<(SocketAddr, Value)>,
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 값 필요", flag))
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                options.config_file = Some(PathBuf::from(value_of(&args, i, "--config")?));
                i += 1;
            }
            "--bind" | "-b" => {
                let text = value_of(&args, i, "--bind")?;
                options.bind = Some(text.parse().map_err(|_| format!("유효한 주소 필요: {}", text))?);
                i += 1;
            }
            "--data" | "-d" => {
                options.data_dir = Some(PathBuf::from(value_of(&args, i, "--data")?));
                i += 1;
            }
            "--trackers" => {
                options.trackers_file = Some(PathBuf::from(value_of(&args, i, "--trackers")?));
                i += 1;
            }
            "--peers" => {
                options.peers_file = Some(PathBuf::from(value_of(&args, i, "--peers")?));
                i += 1;
            }
            "--lan" => options.lan = true,
            "--seed" | "-s" => {
                options.seed.push(value_of(&args, i, "--seed")?.to_string());
                i += 1;
            }
            "--send" => {
                let target = value_of(&args, i, "--send")?;
                let target: SocketAddr = target
                    .parse()
                    .map_err(|_| format!("유효한 주소 필요: {}", target))?;
                let payload = value_of(&args, i + 1, "--send")?;
                let payload: Value = serde_json::from_str(payload)
                    .map_err(|e| format!("유효한 JSON 필요: {}", e))?;
                options.send.push((target, payload));
                i += 2;
            }
            "--help" | "-h" => {
                println!(
                    r#"DSN Node - 탈중앙 소셜 네트워크 피어

UDP 피어 통신 코어
- 피어별 X25519 키 교환 + ChaCha20-Poly1305 세션
- 트래커 랑데부로 NAT 뒤 피어 연결
- 계정별 시더 목록 가십, 청크 단위 미디어 전송

사용법:
  cargo run --release --bin dsn-node -- [OPTIONS]

옵션:
  -c, --config <PATH>        설정 파일 (JSON, 없으면 기본값)
  -b, --bind <ADDR>          바인드 주소 (기본: 0.0.0.0:40001, 환경변수 DSN_BIND)
  -d, --data <DIR>           저장소 루트 (기본: data, 환경변수 DSN_DATA_DIR)
  --trackers <PATH>          트래커 목록 파일 (기본: trackers.json)
  --peers <PATH>             알려진 피어 목록 파일 (기본: peers.json)
  --lan                      짧은 타이머 (LAN/테스트용)
  -s, --seed <ACCOUNT>       계정 시딩 (여러 번 가능)
  --send <ADDR> <JSON>       시작 후 피어에게 메시지 전송 (여러 번 가능)
  -h, --help                 이 도움말 출력

로그 레벨은 RUST_LOG 로 조절 (기본: info)

예시:
  cargo run --release --bin dsn-node -- --data ./data --seed alice
  cargo run --release --bin dsn-node -- --send 198.51.100.7:40001 '["post","hi"]'
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

    // 파일 → 환경변수 → CLI 순
    let mut node_config = NodeConfig::load(options.config_file.as_deref())?;
    if let Some(bind) = options.bind {
        node_config.bind = bind;
    }
    if let Some(dir) = options.data_dir {
        node_config.data_dir = dir;
    }
    if let Some(file) = options.trackers_file {
        node_config.trackers_file = file;
    }
    if let Some(file) = options.peers_file {
        node_config.peers_file = file;
    }

    let config = if options.lan { Config::lan() } else { Config::default() };
    let bootstrap = Bootstrap::load(&node_config.trackers_file, &node_config.peers_file)?;
    let storage = Arc::new(FsStorage::new(&node_config.data_dir)?);

    info!("=== DSN Node ===");
    info!("Bind: {}", node_config.bind);
    info!("Data: {:?}", node_config.data_dir);
    info!(
        "Trackers: {}, known peers: {}",
        bootstrap.trackers.len(),
        bootstrap.peers.len()
    );

    let (receiver, mut events) = Receiver::start(
        config,
        &bootstrap,
        node_config.bind,
        storage,
        Arc::new(MemoryCatalog::new()),
    )
    .await?;
    let receiver = Arc::new(receiver);

    for account in &options.seed {
        receiver.seed(account).await?;
        info!("시딩: {}", account);
    }

    for (target, payload) in options.send {
        let receiver = receiver.clone();
        tokio::spawn(async move {
            match receiver.send(target, payload).await {
                Ok(attempts) => info!("전송 완료 → {} ({}회 시도)", target, attempts),
                Err(e) => warn!("전송 실패 → {}: {}", target, e),
            }
        });
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(NodeEvent::Message { peer, payload }) => {
                    info!("메시지 ← {}: {}", peer.addr, payload);
                }
                Some(NodeEvent::MediaReceived { peer, key }) => {
                    info!("미디어 수신 ← {}: {}", peer.addr, key);
                }
                Some(NodeEvent::TrackerFailure { tracker, reason }) => {
                    warn!("트래커 {}: {}", tracker, reason);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("종료 신호 수신");
                break;
            }
        }
    }

    let stats = receiver.stats().await;
    receiver.stop().await;

    println!("\n=== 통계 ===");
    println!("{}", stats.summary());
    println!("핸드쉐이크: {} 수락, {} 확립", stats.handshakes_accepted, stats.handshakes_completed);
    println!("디코이: {}", stats.decoys_sent);
    println!("브로드캐스트: {}", stats.broadcasts);

    Ok(())
}
