//! Snapshots and state delta application

use crate::bot::{Bot, BotDelta, TagUpdate, Tags};
use crate::edits::apply_tag_edit;
use crate::error::{Error, Result};
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Bot id -> partial bot, or `None` to remove the bot
pub type StateDelta = BTreeMap<String, Option<BotDelta>>;

/// Full local state: every known bot by id.
///
/// Bots are shared between snapshots, so applying a delta only copies the
/// bots it touches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    bots: BTreeMap<String, Arc<Bot>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a baseline snapshot from a JSON map of bots.
    ///
    /// Every bot must be stored under its own id.
    pub fn from_json(json: &str) -> Result<Self> {
        let bots: BTreeMap<String, Bot> =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        if let Some((key, bot)) = bots.iter().find(|(key, bot)| **key != bot.id) {
            return Err(Error::InvalidBotId(format!("{} stored under {}", bot.id, key)));
        }
        Ok(Self {
            bots: bots
                .into_iter()
                .map(|(id, bot)| (id, Arc::new(without_nulls(bot))))
                .collect(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        let bots: BTreeMap<&str, &Bot> = self
            .bots
            .iter()
            .map(|(id, bot)| (id.as_str(), bot.as_ref()))
            .collect();
        serde_json::to_string(&bots).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Bot>> {
        self.bots.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.bots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Bot>)> {
        self.bots.iter().map(|(id, bot)| (id.as_str(), bot))
    }

    /// Apply a state delta, returning the new snapshot
    pub fn apply(&self, delta: &StateDelta) -> Snapshot {
        apply(self, delta)
    }
}

impl FromIterator<Bot> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Bot>>(iter: I) -> Self {
        Self {
            bots: iter
                .into_iter()
                .map(|bot| (bot.id.clone(), Arc::new(without_nulls(bot))))
                .collect(),
        }
    }
}

/// Apply a state delta to a snapshot.
///
/// The input snapshot and delta are left untouched. Null values never reach
/// the result: a null tag, mask or signature is removed in the same pass.
pub fn apply(snapshot: &Snapshot, delta: &StateDelta) -> Snapshot {
    trace!(bots = delta.len(), "Applying state delta");

    let mut bots = snapshot.bots.clone();
    for (id, update) in delta {
        match update {
            None => {
                bots.remove(id);
            }
            Some(partial) => {
                let bot = match bots.get(id) {
                    Some(existing) => apply_bot(existing, partial),
                    None => apply_bot(&Bot::new(id.clone()), partial),
                };
                bots.insert(id.clone(), Arc::new(bot));
            }
        }
    }

    Snapshot { bots }
}

fn apply_bot(existing: &Bot, partial: &BotDelta) -> Bot {
    let mut bot = existing.clone();

    let deleted = apply_tag_updates(&mut bot.tags, &partial.tags);

    if let Some(mask_updates) = &partial.masks {
        let mut masks = bot.masks.take().unwrap_or_default();
        for (space, updates) in mask_updates {
            let tags = masks.entry(space.clone()).or_default();
            apply_tag_updates(tags, updates);
            if tags.is_empty() {
                masks.remove(space);
            }
        }
        bot.masks = (!masks.is_empty()).then_some(masks);
    }

    if let Some(signature_updates) = &partial.signatures {
        let mut signatures = bot.signatures.take().unwrap_or_default();
        for (hash, tag) in signature_updates {
            match tag {
                Some(tag) => {
                    signatures.insert(hash.clone(), tag.clone());
                }
                None => {
                    signatures.remove(hash);
                }
            }
        }
        bot.signatures = (!signatures.is_empty()).then_some(signatures);
    }

    if partial.values.is_some() || (!deleted.is_empty() && bot.values.is_some()) {
        let mut values = bot.values.take().unwrap_or_default();
        if let Some(value_updates) = &partial.values {
            for (name, value) in value_updates {
                values.insert(name.clone(), value.clone());
            }
        }
        for name in &deleted {
            values.remove(name);
        }
        values.retain(|_, value| !value.is_null());
        bot.values = (!values.is_empty()).then_some(values);
    }

    bot
}

/// Drop null tags, mask entries and values from a bot taken as given
fn without_nulls(mut bot: Bot) -> Bot {
    remove_nulls(&mut bot.tags);
    if let Some(mut masks) = bot.masks.take() {
        for tags in masks.values_mut() {
            remove_nulls(tags);
        }
        masks.retain(|_, tags| !tags.is_empty());
        bot.masks = (!masks.is_empty()).then_some(masks);
    }
    if let Some(mut values) = bot.values.take() {
        remove_nulls(&mut values);
        bot.values = (!values.is_empty()).then_some(values);
    }
    bot
}

/// Apply tag updates in place and return the names of the tags that ended up
/// deleted.
fn apply_tag_updates(tags: &mut Tags, updates: &BTreeMap<String, TagUpdate>) -> Vec<String> {
    for (name, update) in updates {
        let value = match update {
            TagUpdate::Value(value) => value.clone(),
            TagUpdate::Edit(edit) => {
                let current = tags.get(name).unwrap_or(&Value::Null);
                apply_tag_edit(current, edit)
            }
        };
        tags.insert(name.clone(), value);
    }
    remove_nulls(tags)
}

/// Remove null entries and return their names
fn remove_nulls(tags: &mut Tags) -> Vec<String> {
    let deleted: Vec<String> = tags
        .iter()
        .filter(|(_, value)| value.is_null())
        .map(|(name, _)| name.clone())
        .collect();
    for name in &deleted {
        tags.remove(name);
    }
    deleted
}
