use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// 容量有限、按插入顺序淘汰的ID集合
///
/// 重复插入不会改变已有ID的位置；超过容量时从最早插入的ID开始淘汰。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ProcessedIds {
    order: VecDeque<String>,
    index: HashSet<String>,
}

impl ProcessedIds {
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 插入ID，返回是否为新ID
    pub fn insert(&mut self, id: String) -> bool {
        if self.index.contains(&id) {
            return false;
        }
        self.index.insert(id.clone());
        self.order.push_back(id);
        true
    }

    /// 淘汰最早的ID直到不超过容量，返回被淘汰的ID
    pub fn evict_to(&mut self, cap: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.order.len() > cap {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
                evicted.push(oldest);
            }
        }
        evicted
    }

    /// 按插入顺序迭代
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for ProcessedIds {
    fn from(ids: Vec<String>) -> Self {
        let mut set = ProcessedIds::default();
        for id in ids {
            set.insert(id);
        }
        set
    }
}

impl From<ProcessedIds> for Vec<String> {
    fn from(ids: ProcessedIds) -> Self {
        ids.order.into_iter().collect()
    }
}

/// 单个feed的检查点
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 已提交记录的时间高水位（Unix秒）
    #[serde(default)]
    pub last_timestamp: Option<i64>,
    #[serde(default)]
    pub processed_ids: ProcessedIds,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// 最近一次全量快照扫描时间（快照对比类feed使用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_full_scan: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// 记录是否需要处理
    ///
    /// `record_timestamp` 仅由按时间去重的feed传入。
    pub fn should_process(&self, record_id: &str, record_timestamp: Option<i64>) -> bool {
        if self.processed_ids.contains(record_id) {
            return false;
        }
        match (record_timestamp, self.last_timestamp) {
            (Some(ts), Some(mark)) => ts >= mark,
            _ => true,
        }
    }

    /// 合并一次已确认批次，返回被淘汰的ID数
    ///
    /// ID做幂等并集；高水位只前进不后退。
    pub fn apply_commit<I>(
        &mut self,
        ids: I,
        high_water_mark: Option<i64>,
        max_ids: usize,
        now: DateTime<Utc>,
    ) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        for id in ids {
            self.processed_ids.insert(id);
        }
        if let Some(mark) = high_water_mark {
            self.last_timestamp = Some(self.last_timestamp.map_or(mark, |old| old.max(mark)));
        }
        self.updated_at = Some(now);
        self.processed_ids.evict_to(max_ids).len()
    }
}
