//! 노드 통계

use std::time::{Duration, Instant};

/// 노드 전체 통계 (이벤트 루프가 갱신, 핸들이 스냅샷 조회)
#[derive(Debug, Clone)]
pub struct NodeStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 수신 데이터그램 수
    pub datagrams_in: u64,

    /// 송신 데이터그램 수
    pub datagrams_out: u64,

    /// 수신 바이트
    pub bytes_in: u64,

    /// 송신 바이트
    pub bytes_out: u64,

    /// 수락한 핸드쉐이크 (응답측)
    pub handshakes_accepted: u64,

    /// 확립된 세션
    pub handshakes_completed: u64,

    /// 피어 결함 (복호화 실패, 쿨다운 위반)
    pub peer_faults: u64,

    /// 제거된 피어
    pub peers_removed: u64,

    /// 보낸 디코이
    pub decoys_sent: u64,

    /// 애플리케이션으로 전달된 메시지
    pub messages_delivered: u64,

    /// 성공한 브로드캐스트
    pub broadcasts: u64,

    pub media_sent: u64,
    pub media_received: u64,
    pub media_failed: u64,

    /// 보낸 데이터 청크 (재전송 포함)
    pub media_chunks_sent: u64,

    /// 순서대로 받은 데이터 청크
    pub media_chunks_received: u64,
}

impl NodeStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            datagrams_in: 0,
            datagrams_out: 0,
            bytes_in: 0,
            bytes_out: 0,
            handshakes_accepted: 0,
            handshakes_completed: 0,
            peer_faults: 0,
            peers_removed: 0,
            decoys_sent: 0,
            messages_delivered: 0,
            broadcasts: 0,
            media_sent: 0,
            media_received: 0,
            media_failed: 0,
            media_chunks_sent: 0,
            media_chunks_received: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 수신 데이터그램 기록
    pub fn record_in(&mut self, size: usize) {
        self.datagrams_in += 1;
        self.bytes_in += size as u64;
    }

    /// 송신 데이터그램 기록
    pub fn record_out(&mut self, size: usize) {
        self.datagrams_out += 1;
        self.bytes_out += size as u64;
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | In: {} ({} B) | Out: {} ({} B) | Sessions: {}/{} | Faults: {} | Removed: {} | Msgs: {} | Media: {} sent, {} recv, {} failed",
            self.elapsed().as_secs_f64(),
            self.datagrams_in,
            self.bytes_in,
            self.datagrams_out,
            self.bytes_out,
            self.handshakes_completed,
            self.handshakes_accepted,
            self.peer_faults,
            self.peers_removed,
            self.messages_delivered,
            self.media_sent,
            self.media_received,
            self.media_failed,
        )
    }
}

impl Default for NodeStats {
    fn default() -> Self {
        Self::new()
    }
}
