//! 미디어 스트림 전송
//!
//! 송신측이 시작하고 수신측이 청크마다 ACK하는 stop-and-wait 전송.
//!
//! ```text
//! 송신                                  수신
//!  ["media", owner, index, sel, N] ──►   카탈로그 확인, 상태 생성
//!                                  ◄──  READY
//!  seq(0) + data                   ──►
//!                                  ◄──  ACK 0
//!  ...
//!  END(0xFFFF) + 패딩              ──►   해시 비교
//!                                  ◄──  ACCEPTED | DECLINED
//! ```
//!
//! 타임아웃 시 같은 프레임을 최대 MAX_TRIAL회 재전송하고, 그래도 응답이
//! 없으면 CANCEL을 보내고 TIMED_OUT으로 끝낸다. 피어당 전송은 1개이며
//! 나머지는 FIFO로 대기한다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::crypto::{hash_content, ContentHash};
use crate::message::{MediaCode, MediaFrame, MediaRequest, PeerMessage, MAX_MEDIA_CHUNKS};
use crate::node::{Node, NodeEvent};
use crate::peer::{Peer, PeerInfo};

/// 요청이 가리키는 로컬 저장 위치와 선언된 해시
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSlot {
    /// 저장소 키
    pub key: String,

    /// 게시물/계정 레코드에 선언된 콘텐츠 해시
    pub hash: ContentHash,
}

/// 도메인 협력자: 미디어 요청 검증
pub trait MediaCatalog: Send + Sync {
    /// 요청된 미디어의 저장 위치, 또는 거절 코드
    fn locate(&self, request: &MediaRequest) -> Result<MediaSlot, MediaCode>;
}

/// 메모리 카탈로그 ((소유자, 인덱스) → 선택자 → 슬롯)
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    posts: RwLock<HashMap<(String, u64), HashMap<String, MediaSlot>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 미디어가 없는 게시물 등록
    pub fn insert_post(&self, owner: &str, index: u64) {
        self.posts
            .write()
            .entry((owner.to_string(), index))
            .or_default();
    }

    pub fn insert(&self, owner: &str, index: u64, selector: &str, slot: MediaSlot) {
        self.posts
            .write()
            .entry((owner.to_string(), index))
            .or_default()
            .insert(selector.to_string(), slot);
    }
}

impl MediaCatalog for MemoryCatalog {
    fn locate(&self, request: &MediaRequest) -> Result<MediaSlot, MediaCode> {
        if request.selector.is_empty() {
            return Err(MediaCode::InfoInvalid);
        }
        let posts = self.posts.read();
        let media = posts
            .get(&(request.owner.clone(), request.index))
            .ok_or(MediaCode::PostNotFound)?;
        media
            .get(&request.selector)
            .cloned()
            .ok_or(MediaCode::NoMedia)
    }
}

/// 대기 중인 송신 미디어
pub struct OutboundMedia {
    pub request: MediaRequest,
    pub data: Bytes,
    reply: Option<oneshot::Sender<MediaCode>>,
}

impl OutboundMedia {
    pub fn new(request: MediaRequest, data: Bytes, reply: oneshot::Sender<MediaCode>) -> Self {
        Self {
            request,
            data,
            reply: Some(reply),
        }
    }

    pub fn resolve(mut self, code: MediaCode) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(code);
        }
    }
}

/// 송신 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// 요청 전송, READY 대기
    Requested,
    /// 청크 전송, ACK 대기
    Transferring,
    /// 종료 마커 전송, 최종 결과 대기
    Finalizing,
}

pub struct OutboundTransfer {
    media: OutboundMedia,
    mtu: usize,
    total: u32,
    /// 현재 ACK를 기다리는 청크
    seq: u32,
    pub phase: Phase,
    pub retries: u32,
    pub deadline: Instant,
}

impl OutboundTransfer {
    fn new(media: OutboundMedia, mtu: usize, deadline: Instant) -> Self {
        Self {
            total: media.request.total_chunks,
            media,
            mtu,
            seq: 0,
            phase: Phase::Requested,
            retries: 0,
            deadline,
        }
    }

    fn chunk(&self, seq: u32) -> Bytes {
        let start = (seq as usize * self.mtu).min(self.media.data.len());
        let end = (start + self.mtu).min(self.media.data.len());
        self.media.data.slice(start..end)
    }

    /// 현재 단계에서 (재)전송할 평문
    fn current_frame(&self) -> Option<Vec<u8>> {
        match self.phase {
            Phase::Requested => {
                serde_json::to_vec(&self.media.request.to_value()).ok()
            }
            Phase::Transferring => Some(
                MediaFrame::Data {
                    seq: self.seq as u16,
                    payload: self.chunk(self.seq),
                }
                .encode(),
            ),
            Phase::Finalizing => Some(MediaFrame::End.encode()),
        }
    }

    /// 다음 청크로 진행 (마지막이면 종료 단계)
    fn advance(&mut self) {
        if self.phase == Phase::Requested {
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        self.phase = if self.seq >= self.total {
            Phase::Finalizing
        } else {
            Phase::Transferring
        };
    }
}

pub struct InboundTransfer {
    pub request: MediaRequest,
    slot: MediaSlot,
    expected: u32,
    received: u32,
    last_seq: Option<u16>,
    buffer: BytesMut,
    pub last_activity: Instant,
}

impl InboundTransfer {
    fn new(request: MediaRequest, slot: MediaSlot, mtu: usize, now: Instant) -> Self {
        Self {
            expected: request.total_chunks,
            buffer: BytesMut::with_capacity(request.total_chunks as usize * mtu),
            request,
            slot,
            received: 0,
            last_seq: None,
            last_activity: now,
        }
    }

    /// 받은 청크 수가 기대치를 넘겼으면 강제 거절 상태
    pub fn is_declined(&self) -> bool {
        self.received > self.expected
    }

    fn force_decline(&mut self) {
        self.received = self.expected + 1;
    }

    pub fn received(&self) -> u32 {
        self.received
    }
}

/// 피어에 붙는 전송 상태
pub enum MediaTransfer {
    Inbound(InboundTransfer),
    Outbound(OutboundTransfer),
}

impl Node {
    /// 송신 미디어 등록. 결과 코드는 반환된 채널로 전달
    pub fn send_media(
        &mut self,
        peer_addr: SocketAddr,
        owner: &str,
        index: u64,
        selector: &str,
        data: Bytes,
        now: Instant,
    ) -> oneshot::Receiver<MediaCode> {
        let (tx, rx) = oneshot::channel();
        let total = self.config.chunks_for(data.len() as u64);
        let request = MediaRequest {
            owner: owner.to_string(),
            index,
            selector: selector.to_string(),
            total_chunks: total.min(u32::MAX as u64) as u32,
        };
        let media = OutboundMedia::new(request, data, tx);

        if total > MAX_MEDIA_CHUNKS as u64 {
            warn!("미디어 청크 수 초과: {} > {}", total, MAX_MEDIA_CHUNKS);
            media.resolve(MediaCode::FileTooLarge);
            return rx;
        }

        let Some(mut peer) = self.registry.take_peer(&peer_addr) else {
            media.resolve(MediaCode::PeerErr);
            return rx;
        };

        if peer.can_send() {
            peer.media_queue.push_back(media);
            self.start_next_media(&mut peer, now);
        } else {
            debug!("세션 없는 피어 {}로 미디어 요청", peer_addr);
            media.resolve(MediaCode::PeerErr);
        }
        self.registry.insert_peer(peer);
        rx
    }

    /// 전송 슬롯이 비었으면 대기열의 다음 전송 시작
    pub(crate) fn start_next_media(&mut self, peer: &mut Peer, now: Instant) {
        if peer.media.is_some() || now < peer.next_send || !peer.can_send() {
            return;
        }
        let Some(media) = peer.media_queue.pop_front() else {
            return;
        };

        info!(
            "미디어 전송 시작 → {}: {}/{}/{} ({} bytes, {} chunks)",
            peer.addr,
            media.request.owner,
            media.request.index,
            media.request.selector,
            media.data.len(),
            media.request.total_chunks
        );
        let transfer = OutboundTransfer::new(media, self.config.mtu, now + self.config.ack_timeout);
        if let Some(frame) = transfer.current_frame() {
            self.send_frame(peer, &frame, now);
        }
        peer.media = Some(MediaTransfer::Outbound(transfer));
    }

    /// 수신측: 전송 요청
    pub(crate) fn on_media_request(&mut self, peer: &mut Peer, request: MediaRequest, now: Instant) {
        let busy = match &peer.media {
            // READY가 유실되어 같은 요청이 다시 옴
            Some(MediaTransfer::Inbound(t)) if t.request == request && t.received == 0 => {
                Some(MediaCode::Ready)
            }
            Some(MediaTransfer::Inbound(t)) if t.is_declined() => None,
            Some(_) => Some(MediaCode::NotReady),
            None => None,
        };
        if let Some(code) = busy {
            self.send_message(peer, &PeerMessage::status(code), now);
            return;
        }
        peer.media = None;

        let code = match self.catalog.locate(&request) {
            Err(code) => code,
            Ok(slot) if self.storage.exists(&slot.key) => MediaCode::MediaFound,
            Ok(_)
                if request.total_chunks > MAX_MEDIA_CHUNKS
                    || request.total_chunks as u64 * self.config.mtu as u64
                        > self.config.max_media_size =>
            {
                MediaCode::FileTooLarge
            }
            Ok(slot) => {
                debug!(
                    "미디어 수신 준비 ← {}: {} ({} chunks)",
                    peer.addr, slot.key, request.total_chunks
                );
                peer.last_media_result = None;
                peer.media = Some(MediaTransfer::Inbound(InboundTransfer::new(
                    request,
                    slot,
                    self.config.mtu,
                    now,
                )));
                MediaCode::Ready
            }
        };

        if code != MediaCode::Ready {
            debug!("미디어 요청 거절 ← {}: {:?}", peer.addr, code);
        }
        self.send_message(peer, &PeerMessage::status(code), now);
    }

    /// 송신측: 상태 코드 수신
    pub(crate) fn on_media_status(
        &mut self,
        peer: &mut Peer,
        code: MediaCode,
        seq: Option<u16>,
        now: Instant,
    ) {
        let Some(MediaTransfer::Outbound(transfer)) = &mut peer.media else {
            debug!("진행 중인 송신 없음, 상태 {:?} 무시 ← {}", code, peer.addr);
            return;
        };

        let advance = match (code, transfer.phase) {
            (MediaCode::Ready, Phase::Requested) => true,
            (MediaCode::Ack, Phase::Transferring) => seq == Some(transfer.seq as u16),
            _ => false,
        };

        if advance {
            transfer.advance();
            transfer.retries = 0;
            transfer.deadline = now + self.config.ack_timeout;
            if transfer.phase == Phase::Transferring {
                self.stats.media_chunks_sent += 1;
            }
            if let Some(frame) = transfer.current_frame() {
                self.send_frame(peer, &frame, now);
            }
            return;
        }

        match code {
            // 중복 READY/ACK
            MediaCode::Ready | MediaCode::Ack => {}
            MediaCode::Accepted if transfer.phase != Phase::Finalizing => {}
            other => self.finish_outbound(peer, other, now),
        }
    }

    fn finish_outbound(&mut self, peer: &mut Peer, code: MediaCode, now: Instant) {
        let Some(MediaTransfer::Outbound(transfer)) = peer.media.take() else {
            return;
        };
        if code == MediaCode::Accepted {
            self.stats.media_sent += 1;
            info!("미디어 전송 완료 → {}", peer.addr);
        } else {
            self.stats.media_failed += 1;
            warn!("미디어 전송 실패 → {}: {:?}", peer.addr, code);
        }
        transfer.media.resolve(code);
        self.start_next_media(peer, now);
    }

    /// 수신측: 바이너리 프레임
    pub(crate) fn on_media_frame(&mut self, peer: &mut Peer, frame: MediaFrame, now: Instant) {
        if !matches!(peer.media, Some(MediaTransfer::Inbound(_))) {
            match frame {
                MediaFrame::Data { .. } => {
                    self.send_message(peer, &PeerMessage::status(MediaCode::Declined), now);
                }
                MediaFrame::End => {
                    let code = peer.last_media_result.unwrap_or(MediaCode::Declined);
                    self.send_message(peer, &PeerMessage::status(code), now);
                }
                MediaFrame::Cancel => {}
            }
            return;
        }
        let Some(MediaTransfer::Inbound(transfer)) = &mut peer.media else {
            return;
        };
        transfer.last_activity = now;

        match frame {
            MediaFrame::Cancel => {
                info!("미디어 전송 취소 ← {}", peer.addr);
                peer.media = None;
                peer.last_media_result = Some(MediaCode::TimedOut);
                self.stats.media_failed += 1;
            }

            MediaFrame::Data { seq, payload } => {
                let reply = if transfer.is_declined() {
                    None
                } else if seq as u32 == transfer.received {
                    if transfer.received >= transfer.expected || payload.len() > self.config.mtu {
                        None
                    } else {
                        transfer.buffer.extend_from_slice(&payload);
                        transfer.received += 1;
                        transfer.last_seq = Some(seq);
                        self.stats.media_chunks_received += 1;
                        Some(Some(seq))
                    }
                } else if transfer.last_seq == Some(seq) {
                    // ACK 유실로 재전송된 청크
                    Some(Some(seq))
                } else {
                    debug!("순서 밖 청크 {} 무시 ← {}", seq, peer.addr);
                    Some(None)
                };

                match reply {
                    Some(Some(seq)) => {
                        self.send_message(peer, &PeerMessage::ack(seq), now);
                    }
                    Some(None) => {}
                    None => {
                        warn!("미디어 강제 거절 ← {}", peer.addr);
                        peer.media = None;
                        peer.last_media_result = Some(MediaCode::Declined);
                        self.send_message(peer, &PeerMessage::status(MediaCode::Declined), now);
                    }
                }
            }

            MediaFrame::End => {
                let complete = !transfer.is_declined()
                    && transfer.received == transfer.expected
                    && hash_content(&transfer.buffer) == transfer.slot.hash;

                if !complete {
                    if !transfer.is_declined() {
                        warn!(
                            "미디어 검증 실패 ← {}: {}/{} chunks",
                            peer.addr, transfer.received, transfer.expected
                        );
                        self.stats.media_failed += 1;
                    }
                    transfer.force_decline();
                    peer.last_media_result = Some(MediaCode::Declined);
                    self.send_message(peer, &PeerMessage::status(MediaCode::Declined), now);
                    return;
                }

                let data = transfer.buffer.split().freeze();
                let key = transfer.slot.key.clone();
                peer.media = None;

                let code = match self.storage.write(&key, &data) {
                    Ok(()) => {
                        info!("미디어 수신 완료 ← {}: {} ({} bytes)", peer.addr, key, data.len());
                        self.stats.media_received += 1;
                        self.events.push(NodeEvent::MediaReceived {
                            peer: PeerInfo::from(&*peer),
                            key,
                        });
                        MediaCode::Accepted
                    }
                    Err(e) => {
                        warn!("미디어 저장 실패 {}: {}", key, e);
                        self.stats.media_failed += 1;
                        MediaCode::PeerErr
                    }
                };
                peer.last_media_result = Some(code);
                self.send_message(peer, &PeerMessage::status(code), now);
            }
        }
    }

    /// 전송 타이머: 재전송, 포기, 유휴 정리
    pub(crate) fn tick_media(&mut self, peer: &mut Peer, now: Instant) {
        match &mut peer.media {
            Some(MediaTransfer::Inbound(transfer)) => {
                let idle = now.saturating_duration_since(transfer.last_activity);
                if idle > self.config.inbound_idle_limit() {
                    warn!("미디어 수신 유휴 만료 ← {}", peer.addr);
                    if !transfer.is_declined() {
                        self.stats.media_failed += 1;
                        peer.last_media_result = Some(MediaCode::TimedOut);
                    }
                    peer.media = None;
                }
            }
            Some(MediaTransfer::Outbound(transfer)) => {
                if now < transfer.deadline {
                    return;
                }
                if transfer.retries >= self.config.max_trial {
                    self.send_frame(peer, &MediaFrame::Cancel.encode(), now);
                    self.finish_outbound(peer, MediaCode::TimedOut, now);
                    return;
                }

                transfer.retries += 1;
                transfer.deadline = now + self.config.ack_timeout;
                debug!(
                    "미디어 재전송 → {} ({:?}, {}/{})",
                    peer.addr, transfer.phase, transfer.retries, self.config.max_trial
                );
                if transfer.phase == Phase::Transferring {
                    self.stats.media_chunks_sent += 1;
                }
                if let Some(frame) = transfer.current_frame() {
                    self.send_frame(peer, &frame, now);
                }
            }
            None => self.start_next_media(peer, now),
        }
    }

    /// 피어 제거 시 전송 정리
    pub(crate) fn abort_media(&mut self, peer: &mut Peer) {
        if let Some(MediaTransfer::Outbound(transfer)) = peer.media.take() {
            transfer.media.resolve(MediaCode::PeerErr);
            self.stats.media_failed += 1;
        }
        for media in peer.media_queue.drain(..) {
            media.resolve(MediaCode::PeerErr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(total_chunks: u32) -> MediaRequest {
        MediaRequest {
            owner: "alice".into(),
            index: 1,
            selector: "0".into(),
            total_chunks,
        }
    }

    #[test]
    fn test_catalog_codes() {
        let catalog = MemoryCatalog::new();
        catalog.insert_post("alice", 2);
        catalog.insert(
            "alice",
            1,
            "0",
            MediaSlot {
                key: "media/alice/1/0".into(),
                hash: [0u8; 32],
            },
        );

        assert!(catalog.locate(&request(1)).is_ok());
        assert_eq!(
            catalog.locate(&MediaRequest { index: 9, ..request(1) }),
            Err(MediaCode::PostNotFound)
        );
        assert_eq!(
            catalog.locate(&MediaRequest { index: 2, ..request(1) }),
            Err(MediaCode::NoMedia)
        );
        assert_eq!(
            catalog.locate(&MediaRequest { selector: String::new(), ..request(1) }),
            Err(MediaCode::InfoInvalid)
        );
    }

    #[test]
    fn test_outbound_chunks_cover_data() {
        let (tx, _rx) = oneshot::channel();
        let data = Bytes::from((0..25u8).collect::<Vec<_>>());
        let media = OutboundMedia::new(request(3), data.clone(), tx);
        let mut transfer = OutboundTransfer::new(media, 10, Instant::now());

        let mut joined = Vec::new();
        transfer.advance();
        while transfer.phase == Phase::Transferring {
            joined.extend_from_slice(&transfer.chunk(transfer.seq));
            transfer.advance();
        }
        assert_eq!(joined, data.to_vec());
        assert_eq!(transfer.phase, Phase::Finalizing);
    }

    #[test]
    fn test_empty_transfer_goes_straight_to_end() {
        let (tx, _rx) = oneshot::channel();
        let media = OutboundMedia::new(request(0), Bytes::new(), tx);
        let mut transfer = OutboundTransfer::new(media, 10, Instant::now());
        transfer.advance();
        assert_eq!(transfer.phase, Phase::Finalizing);
        let frame = transfer.current_frame().unwrap();
        assert_eq!(MediaFrame::decode(&frame), Some(MediaFrame::End));
    }

    #[test]
    fn test_forced_decline_marker() {
        let slot = MediaSlot {
            key: "k".into(),
            hash: [0u8; 32],
        };
        let mut inbound = InboundTransfer::new(request(2), slot, 10, Instant::now());
        assert!(!inbound.is_declined());
        inbound.force_decline();
        assert!(inbound.is_declined());
        assert_eq!(inbound.received(), 3);
    }
}
