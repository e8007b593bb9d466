use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::value_objects::{ConversationId, EventId, Identity, Timestamp, Viewer, ViewerRole};

/// 会话中的一方。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(alias = "_id")]
    pub id: Identity,
    #[serde(default)]
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<Identity>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// 会话关联的活动摘要。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    #[serde(alias = "_id")]
    pub id: EventId,
    #[serde(default)]
    pub title: String,
}

impl EventSummary {
    pub fn new(id: impl Into<EventId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// 会话摘要：一位主办方与一位参与者之间的聊天线程，可以跨多个活动。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(alias = "_id")]
    pub id: ConversationId,
    pub organizer: Participant,
    pub participant: Participant,
    #[serde(default)]
    pub events: Vec<EventSummary>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<Timestamp>,
}

impl Conversation {
    /// 对查看者而言的"另一方"。
    ///
    /// 优先按身份匹配；身份都对不上时按查看者角色决定。
    pub fn counterpart(&self, viewer: &Viewer) -> &Participant {
        if self.organizer.id == viewer.identity {
            &self.participant
        } else if self.participant.id == viewer.identity {
            &self.organizer
        } else {
            match viewer.role {
                ViewerRole::Organizer => &self.participant,
                ViewerRole::Attendee => &self.organizer,
            }
        }
    }

    pub fn counterpart_id(&self, viewer: &Viewer) -> &Identity {
        &self.counterpart(viewer).id
    }

    /// 合并关联活动，已存在的活动不会重复加入。返回新增数量。
    pub fn merge_events(&mut self, events: &[EventSummary]) -> usize {
        let mut added = 0;
        for event in events {
            if !self.events.iter().any(|existing| existing.id == event.id) {
                self.events.push(event.clone());
                added += 1;
            }
        }
        added
    }

    /// 用一条消息刷新最后消息缓存，只接受不早于当前缓存的消息。
    pub fn apply_last_message(&mut self, message: &Message) -> bool {
        let is_newer = self
            .last_message_time
            .map(|current| message.created_at >= current)
            .unwrap_or(true);
        if is_newer {
            self.last_message = Some(message.content.as_str().to_owned());
            self.last_message_time = Some(message.created_at);
        }
        is_newer
    }

    pub fn has_event(&self, event_id: &EventId) -> bool {
        self.events.iter().any(|event| &event.id == event_id)
    }
}
