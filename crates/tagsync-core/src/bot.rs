//! Bots and partial bot updates

use crate::edits::TagEdit;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag name -> value
pub type Tags = BTreeMap<String, Value>;

/// Space -> tag overrides for that space
pub type TagMasks = BTreeMap<String, Tags>;

/// A bot: an id, its tags, and optional space-scoped masks and signatures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masks: Option<TagMasks>,
    /// Signature hash -> signed tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<BTreeMap<String, String>>,
    /// Precalculated tag values maintained by higher layers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Tags>,
}

impl Bot {
    /// Create an empty bot
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: Tags::new(),
            masks: None,
            signatures: None,
            values: None,
        }
    }

    pub fn tag(&self, name: &str) -> Option<&Value> {
        self.tags.get(name)
    }

    /// Tag value as seen from a space: the mask wins over the base tag
    pub fn masked_tag(&self, space: &str, name: &str) -> Option<&Value> {
        self.masks
            .as_ref()
            .and_then(|masks| masks.get(space))
            .and_then(|tags| tags.get(name))
            .or_else(|| self.tag(name))
    }
}

/// Create a bot with the given tags.
///
/// Null tags are kept as given; they disappear once the bot is applied to a
/// snapshot.
pub fn create_bot<K, V>(id: impl Into<String>, tags: impl IntoIterator<Item = (K, V)>) -> Bot
where
    K: Into<String>,
    V: Into<Value>,
{
    let mut bot = Bot::new(id);
    bot.tags = tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
    bot
}

/// How a delta changes a single tag.
///
/// On the wire an edit is an object with `operationGroups`; anything else is
/// a plain value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagUpdate {
    /// Apply a text edit to the current value
    Edit(TagEdit),
    /// Replace the value wholesale (`Null` deletes the tag)
    Value(Value),
}

impl From<Value> for TagUpdate {
    fn from(value: Value) -> Self {
        TagUpdate::Value(value)
    }
}

impl From<TagEdit> for TagUpdate {
    fn from(edit: TagEdit) -> Self {
        TagUpdate::Edit(edit)
    }
}

/// A partial bot carried by a state delta
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotDelta {
    #[serde(default)]
    pub tags: BTreeMap<String, TagUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masks: Option<BTreeMap<String, BTreeMap<String, TagUpdate>>>,
    /// `None` for a hash removes that signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<BTreeMap<String, Option<String>>>,
    /// Precalculated values; `Null` removes the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Tags>,
}

impl BotDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a tag value
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(name.into(), TagUpdate::Value(value.into()));
        self
    }

    /// Edit a tag value
    pub fn tag_edit(mut self, name: impl Into<String>, edit: TagEdit) -> Self {
        self.tags.insert(name.into(), TagUpdate::Edit(edit));
        self
    }

    pub fn delete_tag(self, name: impl Into<String>) -> Self {
        self.tag(name, Value::Null)
    }

    /// Replace a tag mask value in a space
    pub fn mask(
        mut self,
        space: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.masks
            .get_or_insert_with(BTreeMap::new)
            .entry(space.into())
            .or_default()
            .insert(name.into(), TagUpdate::Value(value.into()));
        self
    }

    /// Edit a tag mask value in a space
    pub fn mask_edit(mut self, space: impl Into<String>, name: impl Into<String>, edit: TagEdit) -> Self {
        self.masks
            .get_or_insert_with(BTreeMap::new)
            .entry(space.into())
            .or_default()
            .insert(name.into(), TagUpdate::Edit(edit));
        self
    }

    /// Add (`Some(tag)`) or remove (`None`) a signature
    pub fn signature(mut self, hash: impl Into<String>, tag: Option<String>) -> Self {
        self.signatures
            .get_or_insert_with(BTreeMap::new)
            .insert(hash.into(), tag);
        self
    }

    /// Replace a precalculated value
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values
            .get_or_insert_with(Tags::new)
            .insert(name.into(), value.into());
        self
    }
}

impl From<Bot> for BotDelta {
    fn from(bot: Bot) -> Self {
        Self {
            tags: bot
                .tags
                .into_iter()
                .map(|(k, v)| (k, TagUpdate::Value(v)))
                .collect(),
            masks: bot.masks.map(|masks| {
                masks
                    .into_iter()
                    .map(|(space, tags)| {
                        let tags = tags.into_iter().map(|(k, v)| (k, TagUpdate::Value(v))).collect();
                        (space, tags)
                    })
                    .collect()
            }),
            signatures: bot
                .signatures
                .map(|sigs| sigs.into_iter().map(|(hash, tag)| (hash, Some(tag))).collect()),
            values: bot.values,
        }
    }
}
