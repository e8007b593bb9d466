//! 会话目录
//!
//! 对查看者而言，同一个对方只出现一条会话。后端返回的重复记录按对方身份折叠，
//! 被折叠记录的 id 作为别名指向保留下来的那条。

use std::collections::HashMap;
use std::sync::Arc;

use config::{DedupPolicy, ListOrdering};
use domain::{Conversation, ConversationId, Identity, Message, Viewer};
use tracing::{debug, info, warn};

use crate::error::ApplicationError;
use crate::repository::SelectionStore;

/// 一次刷新请求的凭证
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied,
    Stale,
}

pub struct ConversationDirectory {
    viewer: Viewer,
    policy: DedupPolicy,
    ordering: ListOrdering,
    entries: Vec<Conversation>,
    aliases: HashMap<ConversationId, ConversationId>,
    selected: Option<ConversationId>,
    generation: u64,
    store: Arc<dyn SelectionStore>,
}

impl std::fmt::Debug for ConversationDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationDirectory")
            .field("viewer", &self.viewer.identity)
            .field("entries", &self.entries.len())
            .field("selected", &self.selected)
            .finish()
    }
}

impl ConversationDirectory {
    pub fn new(
        viewer: Viewer,
        policy: DedupPolicy,
        ordering: ListOrdering,
        store: Arc<dyn SelectionStore>,
    ) -> Self {
        Self {
            viewer,
            policy,
            ordering,
            entries: Vec::new(),
            aliases: HashMap::new(),
            selected: None,
            generation: 0,
            store,
        }
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn begin_refresh(&mut self) -> RefreshToken {
        self.generation += 1;
        RefreshToken(self.generation)
    }

    /// 用后端返回的完整列表替换目录，然后恢复选中项
    pub fn complete_refresh(
        &mut self,
        token: RefreshToken,
        records: Vec<Conversation>,
    ) -> RefreshOutcome {
        if token.0 != self.generation {
            debug!("丢弃过期的会话列表结果");
            return RefreshOutcome::Stale;
        }

        let received = records.len();
        let (entries, aliases) = self.dedupe(records);
        self.entries = entries;
        self.aliases = aliases;
        self.apply_ordering();
        self.restore_selection();

        info!(
            received,
            visible = self.entries.len(),
            selected = ?self.selected,
            "会话列表已刷新"
        );
        RefreshOutcome::Applied
    }

    // 按对方身份去重，保留第一条
    fn dedupe(
        &self,
        records: Vec<Conversation>,
    ) -> (Vec<Conversation>, HashMap<ConversationId, ConversationId>) {
        let mut entries: Vec<Conversation> = Vec::with_capacity(records.len());
        let mut by_counterpart: HashMap<Identity, usize> = HashMap::new();
        let mut aliases = HashMap::new();

        for record in records {
            let counterpart = record.counterpart_id(&self.viewer).clone();
            match by_counterpart.get(&counterpart).copied() {
                Some(position) => {
                    let canonical = &mut entries[position];
                    if record.id != canonical.id {
                        aliases.insert(record.id.clone(), canonical.id.clone());
                    }
                    if self.policy == DedupPolicy::MergeEvents {
                        canonical.merge_events(&record.events);
                    }
                    debug!(
                        counterpart = %counterpart,
                        dropped = %record.id,
                        kept = %canonical.id,
                        "折叠重复会话"
                    );
                }
                None => {
                    by_counterpart.insert(counterpart, entries.len());
                    entries.push(record);
                }
            }
        }
        (entries, aliases)
    }

    fn restore_selection(&mut self) {
        let persisted = match self.store.load() {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "读取上次选中的会话失败");
                None
            }
        };

        self.selected = persisted
            .as_ref()
            .and_then(|id| self.resolve(id))
            .or_else(|| self.selected.as_ref().and_then(|id| self.resolve(id)))
            .or_else(|| self.entries.first().map(|entry| entry.id.clone()));
    }

    fn apply_ordering(&mut self) {
        if self.ordering == ListOrdering::RecentActivity {
            // 稳定排序，没有消息的会话排在最后并保持后端顺序
            self.entries
                .sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        }
    }

    /// 主动发起会话后合并进目录：同一对方的条目原位替换，否则插到最前
    pub fn upsert_from_start(&mut self, conversation: Conversation) -> ConversationId {
        let counterpart = conversation.counterpart_id(&self.viewer).clone();
        let id = conversation.id.clone();

        let existing = self
            .entries
            .iter()
            .position(|entry| entry.counterpart_id(&self.viewer) == &counterpart);
        match existing {
            Some(position) => {
                let previous = std::mem::replace(&mut self.entries[position], conversation);
                if self.policy == DedupPolicy::MergeEvents {
                    self.entries[position].merge_events(&previous.events);
                }
                if self.entries[position].last_message_time.is_none() {
                    self.entries[position].last_message = previous.last_message;
                    self.entries[position].last_message_time = previous.last_message_time;
                }
                if previous.id != id {
                    for target in self.aliases.values_mut() {
                        if *target == previous.id {
                            *target = id.clone();
                        }
                    }
                    self.aliases.insert(previous.id.clone(), id.clone());
                    if self.selected.as_ref() == Some(&previous.id) {
                        self.selected = Some(id.clone());
                    }
                }
                debug!(conversation_id = %id, counterpart = %counterpart, "替换已有会话");
            }
            None => {
                self.entries.insert(0, conversation);
                debug!(conversation_id = %id, counterpart = %counterpart, "新增会话");
            }
        }
        self.aliases.remove(&id);
        self.apply_ordering();
        id
    }

    /// 选中会话并持久化；别名会解析到保留的那条
    pub fn select(&mut self, id: &ConversationId) -> Result<ConversationId, ApplicationError> {
        let resolved = self
            .resolve(id)
            .ok_or_else(|| ApplicationError::UnknownConversation(id.clone()))?;
        if let Err(err) = self.store.save(&resolved) {
            warn!(conversation_id = %resolved, error = %err, "保存选中的会话失败");
        }
        self.selected = Some(resolved.clone());
        Ok(resolved)
    }

    /// 用新消息刷新对应条目的最后消息
    pub fn apply_message(&mut self, message: &Message) -> bool {
        let Some(id) = self.resolve(&message.conversation_id) else {
            return false;
        };
        let updated = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .map(|entry| entry.apply_last_message(message))
            .unwrap_or(false);
        if updated {
            self.apply_ordering();
        }
        updated
    }

    /// 按对方名字或活动标题过滤（不区分大小写）
    pub fn filter(&self, query: &str) -> Vec<&Conversation> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.entries.iter().collect();
        }
        self.entries
            .iter()
            .filter(|entry| {
                entry
                    .counterpart(&self.viewer)
                    .name
                    .to_lowercase()
                    .contains(&query)
                    || entry
                        .events
                        .iter()
                        .any(|event| event.title.to_lowercase().contains(&query))
            })
            .collect()
    }

    pub fn event_count(&self, id: &ConversationId) -> usize {
        self.get(id).map(|entry| entry.events.len()).unwrap_or(0)
    }

    /// 把 id（可能是被折叠记录的别名）解析为可见条目的 id
    pub fn resolve(&self, id: &ConversationId) -> Option<ConversationId> {
        if self.entries.iter().any(|entry| &entry.id == id) {
            return Some(id.clone());
        }
        self.aliases
            .get(id)
            .filter(|canonical| self.entries.iter().any(|entry| &entry.id == *canonical))
            .cloned()
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        let resolved = self.resolve(id)?;
        self.entries.iter().find(|entry| entry.id == resolved)
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.entries
    }

    pub fn selected(&self) -> Option<&ConversationId> {
        self.selected.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemorySelectionStore;
    use chrono::{TimeZone, Utc};
    use domain::{EventSummary, MessageContent, MessageId, Participant, ViewerRole};

    fn attendee() -> Viewer {
        Viewer::new(Identity::new("att_1"), "Alice", ViewerRole::Attendee)
    }

    fn record(id: &str, organizer: &str, name: &str, event: &str) -> Conversation {
        Conversation {
            id: ConversationId::new(id),
            organizer: Participant::new(organizer, name),
            participant: Participant::new("att_1", "Alice"),
            events: vec![EventSummary::new(event, format!("Event {event}"))],
            last_message: None,
            last_message_time: None,
        }
    }

    fn directory_with(
        policy: DedupPolicy,
        ordering: ListOrdering,
        store: Arc<MemorySelectionStore>,
    ) -> ConversationDirectory {
        ConversationDirectory::new(attendee(), policy, ordering, store)
    }

    fn refresh(directory: &mut ConversationDirectory, records: Vec<Conversation>) {
        let token = directory.begin_refresh();
        assert_eq!(
            directory.complete_refresh(token, records),
            RefreshOutcome::Applied
        );
    }

    fn two_records_same_organizer() -> Vec<Conversation> {
        vec![
            record("c1", "org_1", "Org One", "ev_1"),
            record("c2", "org_1", "Org One", "ev_2"),
            record("c3", "org_2", "Org Two", "ev_3"),
        ]
    }

    #[test]
    fn collapses_records_sharing_a_counterpart() {
        let mut directory = directory_with(
            DedupPolicy::MergeEvents,
            ListOrdering::Backend,
            Arc::new(MemorySelectionStore::new()),
        );
        refresh(&mut directory, two_records_same_organizer());

        let org_1: Vec<_> = directory
            .conversations()
            .iter()
            .filter(|c| c.organizer.id == Identity::new("org_1"))
            .collect();
        assert_eq!(org_1.len(), 1);
        assert_eq!(org_1[0].id, ConversationId::new("c1"));
        assert_eq!(directory.event_count(&"c1".into()), 2);
        assert_eq!(directory.resolve(&"c2".into()), Some("c1".into()));
    }

    #[test]
    fn drop_policy_keeps_only_first_events() {
        let mut directory = directory_with(
            DedupPolicy::DropDuplicates,
            ListOrdering::Backend,
            Arc::new(MemorySelectionStore::new()),
        );
        refresh(&mut directory, two_records_same_organizer());
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.event_count(&"c1".into()), 1);
    }

    #[test]
    fn refresh_is_idempotent() {
        let mut directory = directory_with(
            DedupPolicy::MergeEvents,
            ListOrdering::Backend,
            Arc::new(MemorySelectionStore::new()),
        );
        refresh(&mut directory, two_records_same_organizer());
        let first = directory.conversations().to_vec();
        refresh(&mut directory, two_records_same_organizer());
        assert_eq!(directory.conversations(), first.as_slice());
    }

    #[test]
    fn stale_refresh_is_discarded() {
        let mut directory = directory_with(
            DedupPolicy::MergeEvents,
            ListOrdering::Backend,
            Arc::new(MemorySelectionStore::new()),
        );
        let old = directory.begin_refresh();
        let new = directory.begin_refresh();
        refresh_with(&mut directory, new, vec![record("c9", "org_9", "Nine", "ev_9")]);
        assert_eq!(
            directory.complete_refresh(old, two_records_same_organizer()),
            RefreshOutcome::Stale
        );
        assert_eq!(directory.len(), 1);
    }

    fn refresh_with(
        directory: &mut ConversationDirectory,
        token: RefreshToken,
        records: Vec<Conversation>,
    ) {
        assert_eq!(
            directory.complete_refresh(token, records),
            RefreshOutcome::Applied
        );
    }

    #[test]
    fn restores_persisted_selection_through_alias() {
        let store = Arc::new(MemorySelectionStore::with_value("c2".into()));
        let mut directory =
            directory_with(DedupPolicy::MergeEvents, ListOrdering::Backend, store);
        refresh(&mut directory, two_records_same_organizer());
        assert_eq!(directory.selected(), Some(&ConversationId::new("c1")));
    }

    #[test]
    fn falls_back_to_first_entry_then_none() {
        let store = Arc::new(MemorySelectionStore::with_value("gone".into()));
        let mut directory =
            directory_with(DedupPolicy::MergeEvents, ListOrdering::Backend, store);
        refresh(&mut directory, two_records_same_organizer());
        assert_eq!(directory.selected(), Some(&ConversationId::new("c1")));

        refresh(&mut directory, vec![]);
        assert_eq!(directory.selected(), None);
    }

    #[test]
    fn select_persists_and_rejects_unknown_ids() {
        let store = Arc::new(MemorySelectionStore::new());
        let mut directory =
            directory_with(DedupPolicy::MergeEvents, ListOrdering::Backend, store.clone());
        refresh(&mut directory, two_records_same_organizer());

        assert_eq!(directory.select(&"c3".into()).unwrap(), "c3".into());
        assert_eq!(store.load().unwrap(), Some("c3".into()));
        assert!(matches!(
            directory.select(&"nope".into()),
            Err(ApplicationError::UnknownConversation(_))
        ));
        assert_eq!(directory.selected(), Some(&ConversationId::new("c3")));
    }

    #[test]
    fn upsert_replaces_same_counterpart_or_prepends() {
        let mut directory = directory_with(
            DedupPolicy::MergeEvents,
            ListOrdering::Backend,
            Arc::new(MemorySelectionStore::new()),
        );
        refresh(&mut directory, two_records_same_organizer());
        directory.select(&"c1".into()).unwrap();

        let id = directory.upsert_from_start(record("c7", "org_1", "Org One", "ev_7"));
        assert_eq!(id, ConversationId::new("c7"));
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.event_count(&"c7".into()), 3);
        assert_eq!(directory.resolve(&"c1".into()), Some("c7".into()));
        assert_eq!(directory.resolve(&"c2".into()), Some("c7".into()));
        assert_eq!(directory.selected(), Some(&ConversationId::new("c7")));

        directory.upsert_from_start(record("c8", "org_8", "Org Eight", "ev_8"));
        assert_eq!(directory.conversations()[0].id, ConversationId::new("c8"));
        assert_eq!(directory.len(), 3);
    }

    #[test]
    fn live_message_updates_entry_and_optionally_reorders() {
        let mut directory = directory_with(
            DedupPolicy::MergeEvents,
            ListOrdering::RecentActivity,
            Arc::new(MemorySelectionStore::new()),
        );
        refresh(&mut directory, two_records_same_organizer());
        assert_eq!(directory.conversations()[0].id, ConversationId::new("c1"));

        let message = Message::new(
            MessageId::new("m1"),
            ConversationId::new("c3"),
            Identity::new("org_2"),
            MessageContent::parse("see you there", 100).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        );
        assert!(directory.apply_message(&message));
        let first = &directory.conversations()[0];
        assert_eq!(first.id, ConversationId::new("c3"));
        assert_eq!(first.last_message.as_deref(), Some("see you there"));

        // 发往被折叠记录的消息落到保留的条目上
        let aliased = Message::new(
            MessageId::new("m2"),
            ConversationId::new("c2"),
            Identity::new("org_1"),
            MessageContent::parse("later", 100).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
        );
        assert!(directory.apply_message(&aliased));
        assert_eq!(directory.conversations()[0].id, ConversationId::new("c1"));
    }

    #[test]
    fn filter_matches_name_or_event_title() {
        let mut directory = directory_with(
            DedupPolicy::MergeEvents,
            ListOrdering::Backend,
            Arc::new(MemorySelectionStore::new()),
        );
        refresh(&mut directory, two_records_same_organizer());

        assert_eq!(directory.filter("org two").len(), 1);
        assert_eq!(directory.filter("EVENT EV_2")[0].id, ConversationId::new("c1"));
        assert_eq!(directory.filter("  ").len(), 2);
        assert!(directory.filter("nothing").is_empty());
    }
}
