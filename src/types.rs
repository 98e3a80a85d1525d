//! Entity registry and typed records.
//!
//! The seven entity types form a fixed, closed registry: everything that
//! addresses "a table" goes through [`EntityKind`] so a missing match arm
//! is a compile error, not a runtime string miss.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GriddleError, Result};

/// Closed registry of persistent entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Story,
    Chapter,
    ChapterComment,
    Discussion,
    DiscussionComment,
    TreeNode,
}

impl EntityKind {
    pub const COUNT: usize = 7;

    /// Every kind, in registry order. Index with [`EntityKind::index`].
    pub const ALL: [EntityKind; Self::COUNT] = [
        EntityKind::User,
        EntityKind::Story,
        EntityKind::Chapter,
        EntityKind::ChapterComment,
        EntityKind::Discussion,
        EntityKind::DiscussionComment,
        EntityKind::TreeNode,
    ];

    /// Deletion order for reconciliation: leaf comment types first, then
    /// chapters/discussions, then tree nodes, stories, and users last, so
    /// the backing store never sees a dangling foreign reference from a
    /// surviving row. Upserts run in the reverse order.
    pub const DELETE_ORDER: [EntityKind; Self::COUNT] = [
        EntityKind::ChapterComment,
        EntityKind::DiscussionComment,
        EntityKind::Chapter,
        EntityKind::Discussion,
        EntityKind::TreeNode,
        EntityKind::Story,
        EntityKind::User,
    ];

    /// Backing-store table name (also the fallback document file stem).
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Story => "stories",
            EntityKind::Chapter => "story_chapters",
            EntityKind::ChapterComment => "chapter_comments",
            EntityKind::Discussion => "discussions",
            EntityKind::DiscussionComment => "discussion_comments",
            EntityKind::TreeNode => "story_tree_nodes",
        }
    }

    pub fn from_table(table: &str) -> Result<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.table() == table)
            .ok_or_else(|| GriddleError::UnknownTable(table.to_string()))
    }

    /// Stable position in [`EntityKind::ALL`], used for per-kind arrays.
    pub fn index(&self) -> usize {
        match self {
            EntityKind::User => 0,
            EntityKind::Story => 1,
            EntityKind::Chapter => 2,
            EntityKind::ChapterComment => 3,
            EntityKind::Discussion => 4,
            EntityKind::DiscussionComment => 5,
            EntityKind::TreeNode => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub registered_at: DateTime<Utc>,
    pub active_count: i64,
    pub points: i64,
    pub credit: f64,
}

impl User {
    pub fn new(id: i64, username: &str, email: &str, password_hash: &str) -> Self {
        User {
            id,
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role: "user".to_string(),
            registered_at: Utc::now(),
            active_count: 0,
            points: 0,
            credit: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Story {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: i64,
    pub tags: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    pub fn new(id: i64, title: &str, content: &str, author_id: i64) -> Self {
        let now = Utc::now();
        Story {
            id,
            title: title.to_string(),
            content: content.to_string(),
            author_id,
            tags: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chapter {
    pub id: i64,
    pub story_id: i64,
    pub content: String,
    pub author_name: String,
    pub author_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Chapter {
    pub fn new(id: i64, story_id: i64, content: &str, author_name: &str, author_id: i64) -> Self {
        Chapter {
            id,
            story_id,
            content: content.to_string(),
            author_name: author_name.to_string(),
            author_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChapterComment {
    pub id: i64,
    pub chapter_id: i64,
    pub content: String,
    pub author_name: String,
    pub author_id: i64,
    pub created_at: DateTime<Utc>,
}

impl ChapterComment {
    pub fn new(id: i64, chapter_id: i64, content: &str, author_name: &str, author_id: i64) -> Self {
        ChapterComment {
            id,
            chapter_id,
            content: content.to_string(),
            author_name: author_name.to_string(),
            author_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Discussion {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_name: String,
    pub author_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Discussion {
    pub fn new(id: i64, title: &str, content: &str, author_name: &str, author_id: i64) -> Self {
        Discussion {
            id,
            title: title.to_string(),
            content: content.to_string(),
            author_name: author_name.to_string(),
            author_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscussionComment {
    pub id: i64,
    pub discussion_id: i64,
    pub content: String,
    pub author_name: String,
    pub author_id: i64,
    pub created_at: DateTime<Utc>,
}

impl DiscussionComment {
    pub fn new(
        id: i64,
        discussion_id: i64,
        content: &str,
        author_name: &str,
        author_id: i64,
    ) -> Self {
        DiscussionComment {
            id,
            discussion_id,
            content: content.to_string(),
            author_name: author_name.to_string(),
            author_id,
            created_at: Utc::now(),
        }
    }
}

/// A node in the collaborative story tree. Roots have no parent; the
/// parent pointer is advisory only; the core does not enforce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeNode {
    pub id: i64,
    pub title: String,
    pub option_title: String,
    pub content: String,
    pub parent_id: Option<i64>,
    pub author_id: i64,
    pub created_at: DateTime<Utc>,
}

impl TreeNode {
    pub fn new(
        id: i64,
        title: &str,
        option_title: &str,
        content: &str,
        parent_id: Option<i64>,
        author_id: i64,
    ) -> Self {
        TreeNode {
            id,
            title: title.to_string(),
            option_title: option_title.to_string(),
            content: content.to_string(),
            parent_id,
            author_id,
            created_at: Utc::now(),
        }
    }
}

/// A record of any registered entity type.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    User(User),
    Story(Story),
    Chapter(Chapter),
    ChapterComment(ChapterComment),
    Discussion(Discussion),
    DiscussionComment(DiscussionComment),
    TreeNode(TreeNode),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::User(_) => EntityKind::User,
            Record::Story(_) => EntityKind::Story,
            Record::Chapter(_) => EntityKind::Chapter,
            Record::ChapterComment(_) => EntityKind::ChapterComment,
            Record::Discussion(_) => EntityKind::Discussion,
            Record::DiscussionComment(_) => EntityKind::DiscussionComment,
            Record::TreeNode(_) => EntityKind::TreeNode,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Record::User(r) => r.id,
            Record::Story(r) => r.id,
            Record::Chapter(r) => r.id,
            Record::ChapterComment(r) => r.id,
            Record::Discussion(r) => r.id,
            Record::DiscussionComment(r) => r.id,
            Record::TreeNode(r) => r.id,
        }
    }

    pub fn set_id(&mut self, id: i64) {
        match self {
            Record::User(r) => r.id = id,
            Record::Story(r) => r.id = id,
            Record::Chapter(r) => r.id = id,
            Record::ChapterComment(r) => r.id = id,
            Record::Discussion(r) => r.id = id,
            Record::DiscussionComment(r) => r.id = id,
            Record::TreeNode(r) => r.id = id,
        }
    }

    /// Serialize the record's field set (including `id`) as a JSON object.
    /// The entity kind is carried out of band: by table name in the SQL
    /// store and by file name in fallback storage.
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            Record::User(r) => serde_json::to_value(r)?,
            Record::Story(r) => serde_json::to_value(r)?,
            Record::Chapter(r) => serde_json::to_value(r)?,
            Record::ChapterComment(r) => serde_json::to_value(r)?,
            Record::Discussion(r) => serde_json::to_value(r)?,
            Record::DiscussionComment(r) => serde_json::to_value(r)?,
            Record::TreeNode(r) => serde_json::to_value(r)?,
        };
        Ok(value)
    }

    /// Inverse of [`Record::to_payload`] for a known kind.
    pub fn from_payload(kind: EntityKind, payload: serde_json::Value) -> Result<Record> {
        let record = match kind {
            EntityKind::User => Record::User(serde_json::from_value(payload)?),
            EntityKind::Story => Record::Story(serde_json::from_value(payload)?),
            EntityKind::Chapter => Record::Chapter(serde_json::from_value(payload)?),
            EntityKind::ChapterComment => Record::ChapterComment(serde_json::from_value(payload)?),
            EntityKind::Discussion => Record::Discussion(serde_json::from_value(payload)?),
            EntityKind::DiscussionComment => {
                Record::DiscussionComment(serde_json::from_value(payload)?)
            }
            EntityKind::TreeNode => Record::TreeNode(serde_json::from_value(payload)?),
        };
        Ok(record)
    }

    /// Field-level merge of a JSON object patch into this record.
    ///
    /// Every patch key must name an existing field other than `id`, and its
    /// value must deserialize into that field's type; otherwise the record
    /// is left unchanged and [`GriddleError::InvalidPatch`] is returned.
    pub fn merge(&mut self, patch: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let mut value = self.to_payload()?;
        let fields = value
            .as_object_mut()
            .ok_or_else(|| GriddleError::InvalidPatch("record is not an object".to_string()))?;

        for (key, new_value) in patch {
            if key == "id" {
                return Err(GriddleError::InvalidPatch("id is immutable".to_string()));
            }
            if !fields.contains_key(key) {
                return Err(GriddleError::InvalidPatch(format!(
                    "unknown field '{}' for {}",
                    key,
                    self.kind().table()
                )));
            }
            fields.insert(key.clone(), new_value.clone());
        }

        let merged = Record::from_payload(self.kind(), value).map_err(|e| {
            GriddleError::InvalidPatch(format!("patch does not fit record schema: {}", e))
        })?;
        *self = merged;
        Ok(())
    }
}
