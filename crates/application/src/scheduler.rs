//! 按键管理截止时间的过期调度器
//!
//! 最小堆 + 每键序号做惰性失效：重新调度或取消某个键时不去堆里删除旧条目，
//! 弹出时发现序号对不上就直接丢弃。时间由调用方传入，测试可以用虚拟时钟。

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

use domain::Timestamp;

#[derive(Debug)]
struct Slot<K> {
    deadline: Timestamp,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Slot<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<K> Eq for Slot<K> {}

impl<K> PartialOrd for Slot<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Slot<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug)]
pub struct ExpiryScheduler<K> {
    heap: BinaryHeap<Reverse<Slot<K>>>,
    live: HashMap<K, (u64, Timestamp)>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone> Default for ExpiryScheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> ExpiryScheduler<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_seq: 0,
        }
    }

    /// 设置（或重置）某个键的截止时间
    pub fn schedule(&mut self, key: K, deadline: Timestamp) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.live.insert(key.clone(), (seq, deadline));
        self.heap.push(Reverse(Slot { deadline, seq, key }));
        self.compact_if_needed();
    }

    /// 取消某个键，返回它是否处于调度中
    pub fn cancel(&mut self, key: &K) -> bool {
        self.live.remove(key).is_some()
    }

    /// 取消所有满足条件的键
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let before = self.live.len();
        self.live.retain(|key, _| !predicate(key));
        before - self.live.len()
    }

    pub fn deadline(&self, key: &K) -> Option<Timestamp> {
        self.live.get(key).map(|(_, deadline)| *deadline)
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// 最近的有效截止时间
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.discard_stale_head();
        self.heap.peek().map(|Reverse(slot)| slot.deadline)
    }

    /// 取出所有截止时间不晚于 `now` 的键，按截止时间先后返回
    pub fn drain_expired(&mut self, now: Timestamp) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let Some(Reverse(slot)) = self.heap.pop() else {
                break;
            };
            if self.is_current(&slot) {
                self.live.remove(&slot.key);
                expired.push(slot.key);
            }
        }
        expired
    }

    fn is_current(&self, slot: &Slot<K>) -> bool {
        self.live
            .get(&slot.key)
            .map(|(seq, _)| *seq == slot.seq)
            .unwrap_or(false)
    }

    fn discard_stale_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.is_current(head) {
                break;
            }
            self.heap.pop();
        }
    }

    // 频繁重置同一个键会堆积失效条目，超过有效条目的两倍时重建堆
    fn compact_if_needed(&mut self) {
        if self.heap.len() <= 64 || self.heap.len() <= self.live.len() * 2 {
            return;
        }
        let live = &self.live;
        let slots: Vec<_> = std::mem::take(&mut self.heap)
            .into_iter()
            .filter(|Reverse(slot)| {
                live.get(&slot.key)
                    .map(|(seq, _)| *seq == slot.seq)
                    .unwrap_or(false)
            })
            .collect();
        self.heap = BinaryHeap::from(slots);
    }
}
