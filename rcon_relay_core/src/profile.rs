use std::{collections::HashMap, sync::Arc, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broadcast::BroadcastKind;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Pattern {name:?} in profile {profile:?} is not a valid regex: {source}")]
    InvalidPattern {
        profile: String,
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("Pattern {name:?} in profile {profile:?} has no named capture groups")]
    NoCaptureGroups { profile: String, name: String },
    #[error("Keep-alive interval for profile {0:?} must be greater than zero")]
    ZeroKeepAlive(String),
    #[error("Keep-alive interval for profile {0:?} can be at most {} seconds", MAX_KEEP_ALIVE_SECS)]
    KeepAliveTooLong(String),
}

/// One day.
pub const MAX_KEEP_ALIVE_SECS: u64 = 24 * 60 * 60;

/// How a game server's remote console speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    /// Source-engine style RCON: authenticated request/response packets. The
    /// server never sends anything unprompted.
    Source {
        #[serde(default)]
        minecraft_quirks: bool,
    },
    /// A plain line-oriented TCP console that streams its log output and
    /// accepts one command per line.
    Console,
}

impl Default for TransportKind {
    fn default() -> Self {
        Self::Source {
            minecraft_quirks: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub interval: Duration,
    pub command: String,
}

/// A named regex whose named capture groups become event fields.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub name: Arc<str>,
    pub kind: BroadcastKind,
    pub regex: Regex,
}

impl Pattern {
    /// Names of every named capture group in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.regex.capture_names().flatten()
    }
}

/// Ordered pattern table. Lookup walks the table front to back so the first
/// declared pattern wins when several could match.
#[derive(Debug, Clone, Default)]
pub struct PatternTable {
    patterns: Vec<Pattern>,
}

impl PatternTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }

    fn compile(profile: &str, configs: &[PatternConfig]) -> Result<Self, ProfileError> {
        let patterns = configs
            .iter()
            .map(|c| {
                let regex = Regex::new(&c.pattern).map_err(|source| ProfileError::InvalidPattern {
                    profile: profile.to_owned(),
                    name: c.name.clone(),
                    source,
                })?;
                if regex.capture_names().flatten().next().is_none() {
                    return Err(ProfileError::NoCaptureGroups {
                        profile: profile.to_owned(),
                        name: c.name.clone(),
                    });
                }
                Ok(Pattern {
                    name: c.name.as_str().into(),
                    kind: c.kind,
                    regex,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }
}

/// Everything the relay needs to know about one game. Built once at startup
/// and shared read-only behind an [`Arc`].
#[derive(Debug)]
pub struct GameProfile {
    pub name: String,
    pub rcon_enabled: bool,
    pub transport: TransportKind,
    pub keep_alive: Option<KeepAlive>,
    pub broadcasts_enabled: bool,
    pub broadcast_patterns: PatternTable,
    pub command_patterns: PatternTable,
    /// Capture group that identifies the player in join/quit/chat lines.
    pub player_field: String,
    /// Command template used to say something in game chat. `{message}` is
    /// replaced by the text.
    pub chat_command: Option<String>,
    pub player_list_command: Option<String>,
}

impl GameProfile {
    /// # Errors
    /// If any pattern fails to compile or the keep-alive interval is zero or
    /// longer than [`MAX_KEEP_ALIVE_SECS`]
    pub fn compile(config: &ProfileConfig) -> Result<Self, ProfileError> {
        let keep_alive = match &config.keep_alive {
            Some(k) if k.interval_secs == 0 => {
                return Err(ProfileError::ZeroKeepAlive(config.name.clone()))
            }
            Some(k) if k.interval_secs > MAX_KEEP_ALIVE_SECS => {
                return Err(ProfileError::KeepAliveTooLong(config.name.clone()))
            }
            Some(k) => Some(KeepAlive {
                interval: Duration::from_secs(k.interval_secs),
                command: k.command.clone(),
            }),
            None => None,
        };

        Ok(Self {
            name: config.name.clone(),
            rcon_enabled: config.rcon_enabled,
            transport: config.transport,
            keep_alive,
            broadcasts_enabled: config.broadcasts_enabled,
            broadcast_patterns: PatternTable::compile(&config.name, &config.broadcast_patterns)?,
            command_patterns: PatternTable::compile(&config.name, &config.command_patterns)?,
            player_field: config.player_field.clone(),
            chat_command: config.chat_command.clone(),
            player_list_command: config.player_list_command.clone(),
        })
    }

    /// Fills in the chat command template. Line breaks are flattened so a
    /// message can never smuggle a second command onto a line console, and
    /// double quotes become single ones when the template quotes the message.
    #[must_use]
    pub fn render_chat_command(&self, message: &str) -> Option<String> {
        let message = message.replace(['\r', '\n'], " ");
        self.chat_command.as_ref().map(|template| {
            let message = if template.contains("\"{message}\"") {
                message.replace('"', "'")
            } else {
                message
            };
            template.replace("{message}", message.trim())
        })
    }
}

// Config

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub name: String,
    #[serde(default)]
    pub kind: BroadcastKind,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    pub interval_secs: u64,
    pub command: String,
}

/// Serializable form of a [`GameProfile`], as found in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    #[serde(default = "enabled")]
    pub rcon_enabled: bool,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub keep_alive: Option<KeepAliveConfig>,
    #[serde(default)]
    pub broadcasts_enabled: bool,
    #[serde(default)]
    pub broadcast_patterns: Vec<PatternConfig>,
    #[serde(default)]
    pub command_patterns: Vec<PatternConfig>,
    pub player_field: String,
    #[serde(default)]
    pub chat_command: Option<String>,
    #[serde(default)]
    pub player_list_command: Option<String>,
}

const fn enabled() -> bool {
    true
}

fn pattern(name: &str, kind: BroadcastKind, pattern: &str) -> PatternConfig {
    PatternConfig {
        name: name.into(),
        kind,
        pattern: pattern.into(),
    }
}

/// Profiles for the games supported out of the box.
#[must_use]
pub fn builtin_profiles() -> Vec<ProfileConfig> {
    vec![
        ProfileConfig {
            name: "tf2".into(),
            rcon_enabled: true,
            transport: TransportKind::Source {
                minecraft_quirks: false,
            },
            keep_alive: Some(KeepAliveConfig {
                interval_secs: 30,
                command: "echo keepalive".into(),
            }),
            broadcasts_enabled: false,
            broadcast_patterns: Vec::new(),
            command_patterns: vec![pattern(
                "status",
                BroadcastKind::Other,
                r#"^#\s*(?P<userid>\d+)\s+"(?P<name>.*)"\s+(?P<steamid>\[U:\d:\d+\])\s+(?P<time>\d*:?\d\d:\d\d)\s+(?P<ping>\d+)\s+(?P<loss>\d+)\s+(?P<state>\w+)"#,
            )],
            player_field: "steamid".into(),
            chat_command: Some("say {message}".into()),
            player_list_command: Some("status".into()),
        },
        ProfileConfig {
            name: "minecraft".into(),
            rcon_enabled: true,
            transport: TransportKind::Source {
                minecraft_quirks: true,
            },
            keep_alive: Some(KeepAliveConfig {
                interval_secs: 30,
                command: "list".into(),
            }),
            broadcasts_enabled: false,
            broadcast_patterns: Vec::new(),
            command_patterns: vec![pattern(
                "list",
                BroadcastKind::Other,
                r"^There are (?P<online>\d+) of a max of (?P<max>\d+) players online:\s*(?P<players>.*)$",
            )],
            player_field: "name".into(),
            chat_command: Some("say {message}".into()),
            player_list_command: Some("list".into()),
        },
        ProfileConfig {
            name: "7dtd".into(),
            rcon_enabled: true,
            transport: TransportKind::Console,
            keep_alive: Some(KeepAliveConfig {
                interval_secs: 60,
                command: "gettime".into(),
            }),
            broadcasts_enabled: true,
            broadcast_patterns: vec![
                pattern(
                    "join",
                    BroadcastKind::Join,
                    r"INF GMSG: Player '(?P<name>.+)' joined the game$",
                ),
                pattern(
                    "quit",
                    BroadcastKind::Quit,
                    r"INF GMSG: Player '(?P<name>.+)' left the game$",
                ),
                pattern(
                    "chat",
                    BroadcastKind::Chat,
                    r"INF Chat \(from '(?P<platform_id>[^']*)', entity id '(?P<entity_id>-?\d+)', to '(?P<channel>\w+)'\): '(?P<name>[^']*)': (?P<message>.*)$",
                ),
            ],
            command_patterns: vec![pattern(
                "player",
                BroadcastKind::Other,
                r"^\d+\. id=(?P<entity_id>\d+), (?P<name>[^,]+), ",
            )],
            player_field: "name".into(),
            chat_command: Some("say \"{message}\"".into()),
            player_list_command: Some("lp".into()),
        },
    ]
}

/// Read-only lookup of [`GameProfile`]s by game name.
#[derive(Debug, Default, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<GameProfile>>,
}

impl ProfileRegistry {
    /// Compiles every config. Later configs replace earlier ones with the
    /// same name, so user-defined profiles override the builtin ones.
    ///
    /// # Errors
    /// If any profile fails to compile
    pub fn from_configs<'a>(
        configs: impl IntoIterator<Item = &'a ProfileConfig>,
    ) -> Result<Self, ProfileError> {
        let mut profiles = HashMap::new();
        for config in configs {
            let profile = GameProfile::compile(config)?;
            if profiles
                .insert(config.name.clone(), Arc::new(profile))
                .is_some()
            {
                tracing::debug!("Profile {:?} overridden", config.name);
            }
        }
        Ok(Self { profiles })
    }

    /// Adds an already compiled profile, replacing one with the same name.
    #[must_use]
    pub fn with_profile(mut self, profile: GameProfile) -> Self {
        self.profiles.insert(profile.name.clone(), Arc::new(profile));
        self
    }

    #[must_use]
    pub fn get(&self, game: &str) -> Option<Arc<GameProfile>> {
        self.profiles.get(game).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_compile() {
        let registry = ProfileRegistry::from_configs(&builtin_profiles()).unwrap();
        assert_eq!(registry.names(), vec!["7dtd", "minecraft", "tf2"]);

        let sdtd = registry.get("7dtd").unwrap();
        assert_eq!(sdtd.transport, TransportKind::Console);
        assert!(sdtd.broadcasts_enabled);
        assert_eq!(sdtd.broadcast_patterns.len(), 3);
        assert!(registry.get("quake").is_none());
    }

    #[test]
    fn later_configs_override() {
        let mut configs = builtin_profiles();
        let mut custom = configs[1].clone();
        custom.rcon_enabled = false;
        configs.push(custom);

        let registry = ProfileRegistry::from_configs(&configs).unwrap();
        assert!(!registry.get("minecraft").unwrap().rcon_enabled);
    }

    #[test]
    fn rejects_bad_patterns() {
        let mut config = builtin_profiles().remove(2);
        config.broadcast_patterns.push(pattern("broken", BroadcastKind::Other, "(unclosed"));
        assert!(matches!(
            GameProfile::compile(&config),
            Err(ProfileError::InvalidPattern { .. })
        ));

        let mut config = builtin_profiles().remove(2);
        config.broadcast_patterns.push(pattern("plain", BroadcastKind::Other, "^no groups$"));
        assert!(matches!(
            GameProfile::compile(&config),
            Err(ProfileError::NoCaptureGroups { .. })
        ));

        let mut config = builtin_profiles().remove(0);
        config.keep_alive = Some(KeepAliveConfig {
            interval_secs: 0,
            command: "echo".into(),
        });
        assert!(matches!(
            GameProfile::compile(&config),
            Err(ProfileError::ZeroKeepAlive(_))
        ));

        config.keep_alive = Some(KeepAliveConfig {
            interval_secs: u64::MAX,
            command: "echo".into(),
        });
        assert!(matches!(
            GameProfile::compile(&config),
            Err(ProfileError::KeepAliveTooLong(_))
        ));
        config.keep_alive = Some(KeepAliveConfig {
            interval_secs: MAX_KEEP_ALIVE_SECS,
            command: "echo".into(),
        });
        assert!(GameProfile::compile(&config).is_ok());
    }

    #[test]
    fn chat_command_is_single_line() {
        let registry = ProfileRegistry::from_configs(&builtin_profiles()).unwrap();
        let tf2 = registry.get("tf2").unwrap();
        assert_eq!(
            tf2.render_chat_command("hello\nquit").as_deref(),
            Some("say hello quit")
        );
    }

    #[test]
    fn quoted_chat_command_keeps_its_quotes_balanced() {
        let registry = ProfileRegistry::from_configs(&builtin_profiles()).unwrap();
        let sdtd = registry.get("7dtd").unwrap();
        assert_eq!(
            sdtd.render_chat_command(r#"he said "hi" "#).as_deref(),
            Some(r#"say "he said 'hi'""#)
        );

        // Unquoted templates pass quotes through.
        let tf2 = registry.get("tf2").unwrap();
        assert_eq!(
            tf2.render_chat_command(r#"he said "hi""#).as_deref(),
            Some(r#"say he said "hi""#)
        );
    }

    #[test]
    fn profile_config_from_yaml() {
        let yaml = r#"
name: custom
transport:
  kind: console
broadcasts_enabled: true
broadcast_patterns:
  - name: join
    kind: join
    pattern: '^(?P<ID>\w+) joined$'
player_field: ID
"#;
        let config: ProfileConfig = serde_yaml::from_str(yaml).unwrap();
        let profile = GameProfile::compile(&config).unwrap();
        assert!(profile.rcon_enabled);
        assert!(profile.keep_alive.is_none());
        assert_eq!(profile.transport, TransportKind::Console);
        assert_eq!(profile.broadcast_patterns.iter().next().unwrap().kind, BroadcastKind::Join);
    }
}
