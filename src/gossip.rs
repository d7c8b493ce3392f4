//! 계정별 시더 목록과 브로드캐스트 대상 선택
//!
//! 목록은 `"ip:port"` 바이트 순으로 정렬되고, 내 위치에서 바깥쪽으로
//! (+1, -1, +2, -2 ...) 번갈아 걸으며 대상을 고른다. 같은 목록과 위치는
//! 항상 같은 대상 집합을 낸다.

use std::collections::HashMap;
use std::net::SocketAddr;

/// 한 계정의 시더 목록
#[derive(Debug, Clone, Default)]
pub struct SeederList {
    peers: Vec<SocketAddr>,
    my_position: usize,
    /// false면 정렬/위치 캐시가 낡음
    sorted: bool,
}

impl SeederList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_peers(peers: Vec<SocketAddr>) -> Self {
        Self {
            peers,
            my_position: 0,
            sorted: false,
        }
    }

    pub fn insert(&mut self, addr: SocketAddr) {
        if !self.peers.contains(&addr) {
            self.peers.push(addr);
            self.sorted = false;
        }
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != addr);
        let removed = self.peers.len() != before;
        if removed {
            self.sorted = false;
        }
        removed
    }

    pub fn invalidate(&mut self) {
        self.sorted = false;
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// 정렬된 경우에만 유효
    pub fn my_position(&self) -> Option<usize> {
        self.sorted.then_some(self.my_position)
    }

    /// 재정렬 후 내 위치를 찾는다 (없으면 제자리에 삽입)
    pub fn refresh(&mut self, me: Option<SocketAddr>) {
        self.peers.sort_by_cached_key(|p| p.to_string());
        self.peers.dedup();

        self.my_position = match me {
            Some(me) => {
                let key = me.to_string();
                match self.peers.binary_search_by(|p| p.to_string().cmp(&key)) {
                    Ok(position) => position,
                    Err(position) => {
                        self.peers.insert(position, me);
                        position
                    }
                }
            }
            None => 0,
        };
        self.sorted = true;
    }

    /// 최대 `n`개의 서로 다른 대상 (나 제외)
    pub fn select(&mut self, n: usize, me: Option<SocketAddr>) -> Vec<SocketAddr> {
        if !self.sorted {
            self.refresh(me);
        }

        let len = self.peers.len();
        let origin = self.my_position;
        let mut picked = Vec::with_capacity(n.min(len));

        // 내 주소를 모르면 0번 자리도 후보
        if me.is_none() && n > 0 && len > 0 {
            picked.push(self.peers[0]);
        }

        let mut offset = 1;
        while picked.len() < n && (origin + offset < len || offset <= origin) {
            let sides = [
                Some(origin + offset).filter(|&i| i < len),
                origin.checked_sub(offset),
            ];
            for index in sides.into_iter().flatten() {
                if picked.len() >= n {
                    break;
                }
                let addr = self.peers[index];
                if Some(addr) != me && !picked.contains(&addr) {
                    picked.push(addr);
                }
            }
            offset += 1;
        }

        picked
    }
}

/// 프로세스 전체 시더 목록 (계정 → 목록)
#[derive(Debug, Default)]
pub struct GossipState {
    lists: HashMap<String, SeederList>,
}

impl GossipState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, account: &str) -> Option<&SeederList> {
        self.lists.get(account)
    }

    /// 트래커가 보낸 목록으로 교체
    pub fn replace(&mut self, account: &str, peers: Vec<SocketAddr>) {
        self.lists
            .insert(account.to_string(), SeederList::from_peers(peers));
    }

    pub fn insert(&mut self, account: &str, addr: SocketAddr) {
        self.lists
            .entry(account.to_string())
            .or_default()
            .insert(addr);
    }

    pub fn remove(&mut self, account: &str, addr: &SocketAddr) {
        if let Some(list) = self.lists.get_mut(account) {
            list.remove(addr);
        }
    }

    /// 내 주소가 바뀌면 모든 위치 캐시가 낡음
    pub fn invalidate_all(&mut self) {
        for list in self.lists.values_mut() {
            list.invalidate();
        }
    }

    /// 모든 목록에서 주소 제거 (이전 내 주소 등)
    pub fn forget(&mut self, addr: &SocketAddr) {
        for list in self.lists.values_mut() {
            list.remove(addr);
        }
    }

    pub fn select(&mut self, account: &str, n: usize, me: Option<SocketAddr>) -> Vec<SocketAddr> {
        match self.lists.get_mut(account) {
            Some(list) => list.select(n, me),
            None => Vec::new(),
        }
    }
}
