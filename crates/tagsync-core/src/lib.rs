//! tagsync Core - tag edits and snapshot merging
//!
//! This crate provides the state side of tagsync:
//! - Version vectors for ordering concurrent edits
//! - Text edit operations on tag values
//! - Bots (tags, space masks, signatures) and partial bot deltas
//! - Pure application of state deltas onto snapshots

pub mod bot;
pub mod edits;
pub mod error;
pub mod snapshot;
pub mod value;
pub mod version;

pub use bot::{create_bot, Bot, BotDelta, TagMasks, TagUpdate, Tags};
pub use edits::{
    apply_edit, apply_tag_edit, delete, edit, edits, insert, merge_edits, preserve,
    try_apply_edit, EditOp, TagEdit,
};
pub use error::{Error, Result};
pub use snapshot::{apply, Snapshot, StateDelta};
pub use value::{Number, Value};
pub use version::{SiteId, VersionVector};
