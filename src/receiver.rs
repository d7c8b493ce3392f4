//! 노드 런타임 (액터)
//!
//! - 수신 태스크: 소켓 → `NodeCmd::Datagram`
//! - 타이머 태스크: 주기적 `NodeCmd::Tick`
//! - 메인 태스크: 엔진(`Node`)을 소유, 명령을 순서대로 처리하고
//!   쌓인 데이터그램 송신, 이벤트 전달, 통계 스냅샷 갱신
//!
//! 외부 API는 응답 채널을 담은 명령을 보낸다. 엔진 상태는 메인 태스크
//! 밖으로 나가지 않는다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::media::MediaCatalog;
use crate::message::MediaCode;
use crate::node::{Delivery, Node, NodeEvent};
use crate::stats::NodeStats;
use crate::storage::{load_or_create_identity, read_async, Storage};
use crate::transport::{Transport, RECV_BUFFER_SIZE};
use crate::{Bootstrap, Config, Error, Result};

/// 애플리케이션 이벤트 수신기
pub type EventReceiver = mpsc::Receiver<NodeEvent>;

/// 내부 명령
enum NodeCmd {
    Datagram {
        from: SocketAddr,
        data: Vec<u8>,
    },
    Tick,
    Send {
        target: SocketAddr,
        payload: Value,
        reply: oneshot::Sender<Result<Delivery>>,
    },
    Broadcast {
        account: String,
        amount: usize,
        payload: Value,
        reply: oneshot::Sender<bool>,
    },
    SendMedia {
        peer: SocketAddr,
        owner: String,
        index: u64,
        selector: String,
        data: Bytes,
        reply: oneshot::Sender<oneshot::Receiver<MediaCode>>,
    },
    Seed {
        account: String,
        reply: oneshot::Sender<bool>,
    },
    Unseed {
        account: String,
        reply: oneshot::Sender<bool>,
    },
    Stop,
}

/// 메인 태스크 상태
struct NodeInner {
    node: Node,
    transport: Transport,
    events_tx: mpsc::Sender<NodeEvent>,
}

impl NodeInner {
    fn handle(&mut self, cmd: NodeCmd) {
        let now = Instant::now();
        match cmd {
            NodeCmd::Datagram { from, data } => self.node.handle_datagram(from, &data, now),
            NodeCmd::Tick => self.node.on_tick(now),
            NodeCmd::Send {
                target,
                payload,
                reply,
            } => {
                let _ = reply.send(self.node.send(target, &payload, now));
            }
            NodeCmd::Broadcast {
                account,
                amount,
                payload,
                reply,
            } => {
                let _ = reply.send(self.node.broadcast(&account, amount, &payload, now));
            }
            NodeCmd::SendMedia {
                peer,
                owner,
                index,
                selector,
                data,
                reply,
            } => {
                let rx = self
                    .node
                    .send_media(peer, &owner, index, &selector, data, now);
                let _ = reply.send(rx);
            }
            NodeCmd::Seed { account, reply } => {
                let _ = reply.send(self.node.seed(&account));
            }
            NodeCmd::Unseed { account, reply } => {
                let _ = reply.send(self.node.unseed(&account));
            }
            NodeCmd::Stop => {}
        }
    }

    /// 엔진 출력 처리: 데이터그램 송신, 이벤트 전달
    async fn flush(&mut self) {
        let mut outbox = self.node.take_outbox();
        if !outbox.is_empty() {
            self.transport.flush(&mut outbox).await;
        }

        for event in self.node.drain_events() {
            if let Err(e) = self.events_tx.try_send(event) {
                warn!("이벤트 채널 가득 참, 이벤트 폐기: {}", e);
            }
        }
    }
}

/// 노드 핸들 (외부에서 제어용)
pub struct Receiver {
    cmd_tx: mpsc::Sender<NodeCmd>,
    stats: Arc<RwLock<NodeStats>>,
    my_address: Arc<RwLock<Option<SocketAddr>>>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    storage: Arc<dyn Storage>,
    broadcast_amount: usize,
}

impl Receiver {
    /// 노드 시작. 신원 키는 저장소에서 읽거나 새로 만든다
    pub async fn start(
        config: Config,
        bootstrap: &Bootstrap,
        bind_addr: SocketAddr,
        storage: Arc<dyn Storage>,
        catalog: Arc<dyn MediaCatalog>,
    ) -> Result<(Self, EventReceiver)> {
        let keys = load_or_create_identity(storage.as_ref())?;
        let node = Node::new(
            config.clone(),
            keys,
            bootstrap,
            storage.clone(),
            catalog,
            Instant::now(),
        )?;

        let transport = Transport::bind(bind_addr).await?;
        let local_addr = transport.local_addr()?;

        // 채널 생성
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<NodeCmd>(1000);
        let (events_tx, events_rx) = mpsc::channel::<NodeEvent>(1000);

        // 공유 상태
        let stats = Arc::new(RwLock::new(NodeStats::new()));
        let my_address = Arc::new(RwLock::new(None));
        let running = Arc::new(AtomicBool::new(true));

        info!(
            "DSN node started on {}, public key {}",
            local_addr,
            hex::encode(node.public_key())
        );

        let mut inner = NodeInner {
            node,
            transport: transport.clone(),
            events_tx,
        };

        // 수신 태스크
        let cmd_tx_recv = cmd_tx.clone();
        let running_recv = running.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];

            while running_recv.load(Ordering::SeqCst) {
                match tokio::time::timeout(Duration::from_millis(100), transport.recv(&mut buf)).await
                {
                    Ok(Ok((len, from))) => {
                        let cmd = NodeCmd::Datagram {
                            from,
                            data: buf[..len].to_vec(),
                        };
                        if cmd_tx_recv.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        // ICMP unreachable 등은 무시하고 계속
                        debug!("수신 에러: {}", e);
                    }
                    Err(_) => {
                        // 타임아웃, 계속
                    }
                }
            }
        });

        // 틱 타이머 태스크
        let cmd_tx_tick = cmd_tx.clone();
        let running_tick = running.clone();
        let tick_interval = config.tick_interval;

        tokio::spawn(async move {
            while running_tick.load(Ordering::SeqCst) {
                tokio::time::sleep(tick_interval).await;
                if cmd_tx_tick.send(NodeCmd::Tick).await.is_err() {
                    break;
                }
            }
        });

        // 메인 처리 태스크
        let stats_main = stats.clone();
        let my_address_main = my_address.clone();
        let running_main = running.clone();

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let stop = matches!(cmd, NodeCmd::Stop);
                inner.handle(cmd);
                inner.flush().await;
                if stop {
                    break;
                }

                // 스냅샷 갱신
                *stats_main.write().await = inner.node.stats().clone();
                let address = inner.node.my_address();
                if *my_address_main.read().await != address {
                    *my_address_main.write().await = address;
                }
            }

            info!("노드 종료: {}", inner.node.stats().summary());
            running_main.store(false, Ordering::SeqCst);
        });

        let receiver = Self {
            cmd_tx,
            stats,
            my_address,
            running,
            local_addr,
            storage,
            broadcast_amount: config.broadcast_amount,
        };

        Ok((receiver, events_rx))
    }

    async fn request<T>(&self, cmd: NodeCmd, rx: oneshot::Receiver<T>) -> Result<T> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// 피어에게 JSON 배열/객체 전송. 연결이 필요하면 수립까지 기다림
    ///
    /// 반환: 사용한 연결 시도 횟수
    pub async fn send(&self, target: SocketAddr, payload: Value) -> Result<u32> {
        let (reply, rx) = oneshot::channel();
        let cmd = NodeCmd::Send {
            target,
            payload,
            reply,
        };
        match self.request(cmd, rx).await?? {
            Delivery::Sent(attempts) => Ok(attempts),
            Delivery::Pending(pending) => pending.await.map_err(|_| Error::Stopped)?,
        }
    }

    /// 기본 팬아웃으로 계정 시더에게 전송
    pub async fn broadcast(&self, account: &str, payload: Value) -> Result<bool> {
        self.broadcast_to(account, self.broadcast_amount, payload)
            .await
    }

    pub async fn broadcast_to(&self, account: &str, amount: usize, payload: Value) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        let cmd = NodeCmd::Broadcast {
            account: account.to_string(),
            amount,
            payload,
            reply,
        };
        self.request(cmd, rx).await
    }

    /// 저장소의 미디어를 세션이 있는 피어에게 전송
    pub async fn send_media(
        &self,
        peer: SocketAddr,
        owner: &str,
        index: u64,
        selector: &str,
        key: &str,
    ) -> Result<MediaCode> {
        let data = match read_async(self.storage.clone(), key.to_string()).await {
            Ok(data) => data,
            Err(Error::NotFound(_)) => return Ok(MediaCode::FileNotFound),
            Err(e) => {
                warn!("미디어 읽기 실패 {}: {}", key, e);
                return Ok(MediaCode::FileNotReady);
            }
        };

        let (reply, rx) = oneshot::channel();
        let cmd = NodeCmd::SendMedia {
            peer,
            owner: owner.to_string(),
            index,
            selector: selector.to_string(),
            data,
            reply,
        };
        let result = self.request(cmd, rx).await?;
        result.await.map_err(|_| Error::Stopped)
    }

    /// 계정 시딩 시작 (트래커에 알림)
    pub async fn seed(&self, account: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        let cmd = NodeCmd::Seed {
            account: account.to_string(),
            reply,
        };
        self.request(cmd, rx).await
    }

    pub async fn unseed(&self, account: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        let cmd = NodeCmd::Unseed {
            account: account.to_string(),
            reply,
        };
        self.request(cmd, rx).await
    }

    /// 정지
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(NodeCmd::Stop).await;
    }

    /// 통계 반환
    pub async fn stats(&self) -> NodeStats {
        self.stats.read().await.clone()
    }

    /// 트래커가 알려준 외부 주소
    pub async fn my_address(&self) -> Option<SocketAddr> {
        *self.my_address.read().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
