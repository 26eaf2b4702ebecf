//! Turns raw console lines into typed events using a profile's pattern tables.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    profile::{GameProfile, Pattern, PatternTable},
    store::ServerId,
};

/// Capture group name -> matched text.
pub type Fields = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastKind {
    Join,
    Quit,
    Chat,
    #[default]
    Other,
}

/// A line that matched one entry of a pattern table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub kind: BroadcastKind,
    pub pattern: Arc<str>,
    pub fields: Fields,
}

/// A parsed broadcast together with where it came from.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub kind: BroadcastKind,
    pub pattern: Arc<str>,
    pub fields: Fields,
    pub server: ServerId,
    pub profile: Arc<GameProfile>,
}

impl Broadcast {
    #[must_use]
    pub fn new(parsed: ParsedLine, server: ServerId, profile: Arc<GameProfile>) -> Self {
        Self {
            kind: parsed.kind,
            pattern: parsed.pattern,
            fields: parsed.fields,
            server,
            profile,
        }
    }

    /// The value of the profile's player field, if the pattern captured one.
    #[must_use]
    pub fn player(&self) -> Option<&str> {
        self.fields
            .get(&self.profile.player_field)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }
}

/// Classifies a line against the profile's broadcast table. Most lines are
/// not broadcasts, so `None` is the common case.
#[must_use]
pub fn classify(line: &str, profile: &GameProfile) -> Option<ParsedLine> {
    match_table(line, &profile.broadcast_patterns)
}

/// Runs every line of a command's output through the profile's command table.
#[must_use]
pub fn parse_command_output(output: &str, profile: &GameProfile) -> Vec<ParsedLine> {
    output
        .lines()
        .filter_map(|line| match_table(line, &profile.command_patterns))
        .collect()
}

fn match_table(line: &str, table: &PatternTable) -> Option<ParsedLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    table.iter().find_map(|pattern| extract(line, pattern))
}

fn extract(line: &str, pattern: &Pattern) -> Option<ParsedLine> {
    let captures = pattern.regex.captures(line)?;

    // Every named group gets an entry, groups that didn't participate are empty.
    let fields = pattern
        .field_names()
        .map(|name| {
            let value = captures.name(name).map_or("", |m| m.as_str());
            (name.to_owned(), value.to_owned())
        })
        .collect();

    Some(ParsedLine {
        kind: pattern.kind,
        pattern: pattern.name.clone(),
        fields,
    })
}
