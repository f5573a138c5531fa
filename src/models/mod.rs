use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Text providers use for "we don't know this yet".
pub const PLACEHOLDER: &str = "???";

/// True when a provider string carries no information.
pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == PLACEHOLDER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    #[serde(rename = "bgm")]
    Bangumi,
    Vndb,
    Ymgal,
    Cngal,
    Offline,
}

impl SourceId {
    pub const ALL: [SourceId; 5] = [
        SourceId::Bangumi,
        SourceId::Vndb,
        SourceId::Ymgal,
        SourceId::Cngal,
        SourceId::Offline,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            SourceId::Bangumi => "bgm",
            SourceId::Vndb => "vndb",
            SourceId::Ymgal => "ymgal",
            SourceId::Cngal => "cngal",
            SourceId::Offline => "offline",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.tag().eq_ignore_ascii_case(tag))
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceId::Bangumi => write!(f, "Bangumi"),
            SourceId::Vndb => write!(f, "VNDB"),
            SourceId::Ymgal => write!(f, "YMGal"),
            SourceId::Cngal => write!(f, "CnGal"),
            SourceId::Offline => write!(f, "Offline catalog"),
        }
    }
}

/// Field categories that carry their own provider priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Name,
    LocalizedName,
    Description,
    Developer,
    CoverImage,
    ReleaseDate,
    Rating,
    PlayTime,
    Tags,
    Characters,
    Staff,
}

/// A value that can be the placeholder.
pub trait Known {
    fn is_known(&self) -> bool;
}

impl Known for String {
    fn is_known(&self) -> bool {
        !is_placeholder(self)
    }
}

impl Known for f32 {
    fn is_known(&self) -> bool {
        self.is_finite() && *self > 0.0
    }
}

impl Known for NaiveDate {
    fn is_known(&self) -> bool {
        true
    }
}

impl<T> Known for Vec<T> {
    fn is_known(&self) -> bool {
        !self.is_empty()
    }
}

/// Names plus per-provider ids for one real-world entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub display_name: Option<String>,
    pub localized_name: Option<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<SourceId, String>,
}

impl Identity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, source: SourceId, id: impl Into<String>) -> Self {
        self.external_ids.insert(source, id.into());
        self
    }

    pub fn with_localized(mut self, name: impl Into<String>) -> Self {
        self.localized_name = Some(name.into());
        self
    }

    /// External id for `source`, ignoring empty slots.
    pub fn id(&self, source: SourceId) -> Option<&str> {
        self.external_ids
            .get(&source)
            .map(|s| s.as_str())
            .filter(|s| !is_placeholder(s))
    }

    pub fn name(&self) -> Option<&str> {
        self.display_name.as_deref().filter(|s| !is_placeholder(s))
    }

    pub fn localized(&self) -> Option<&str> {
        self.localized_name.as_deref().filter(|s| !is_placeholder(s))
    }

    pub fn has_any_id(&self) -> bool {
        SourceId::ALL.iter().any(|s| self.id(*s).is_some())
    }

    /// Fill slots that are empty here from `other`; never overwrites.
    pub fn absorb(&mut self, other: &Identity) {
        if self.name().is_none() {
            if let Some(name) = other.name() {
                self.display_name = Some(name.to_string());
            }
        }
        if self.localized().is_none() {
            if let Some(name) = other.localized() {
                self.localized_name = Some(name.to_string());
            }
        }
        for source in SourceId::ALL {
            if self.id(source).is_none() {
                if let Some(id) = other.id(source) {
                    self.external_ids.insert(source, id.to_string());
                }
            }
        }
    }

    /// Short human label for logs and progress lines.
    pub fn label(&self) -> String {
        if let Some(name) = self.name().or_else(|| self.localized()) {
            return name.to_string();
        }
        SourceId::ALL
            .iter()
            .find_map(|s| self.id(*s).map(|id| format!("{}:{}", s.tag(), id)))
            .unwrap_or_else(|| PLACEHOLDER.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Producer,
    Director,
    Writer,
    Artist,
    Musician,
    Singer,
    VoiceActor,
    Staff(String),
}

impl Role {
    /// Map a provider's credit label onto a role.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "producer" | "制作人" => Role::Producer,
            "director" | "导演" => Role::Director,
            "writer" | "scenario" | "script" | "脚本" | "剧本" => Role::Writer,
            "artist" | "art" | "illustrator" | "原画" => Role::Artist,
            "musician" | "composer" | "music" | "音乐" => Role::Musician,
            "singer" | "vocals" | "主题歌演出" => Role::Singer,
            "voice actor" | "seiyuu" | "cv" | "声优" => Role::VoiceActor,
            _ => Role::Staff(label.trim().to_string()),
        }
    }
}

pub type RoleSet = BTreeSet<Role>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterRole {
    Main,
    Supporting,
    #[default]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub identity: Identity,
    #[serde(default)]
    pub role: CharacterRole,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

impl Character {
    pub fn needs_detail(&self) -> bool {
        !known_text(&self.description) && !known_text(&self.image_url)
    }

    /// Fill missing detail from another sighting of the same character.
    pub fn absorb(&mut self, other: &Character) {
        self.identity.absorb(&other.identity);
        if !known_text(&self.description) && known_text(&other.description) {
            self.description = other.description.clone();
        }
        if !known_text(&self.image_url) && known_text(&other.image_url) {
            self.image_url = other.image_url.clone();
        }
        if self.role == CharacterRole::Other {
            self.role = other.role;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonFragment {
    pub identity: Identity,
    pub image_url: Option<String>,
    pub description: Option<String>,
}

/// One person credited on a game, with every role from that credit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaffCredit {
    pub person: PersonFragment,
    #[serde(default)]
    pub roles: RoleSet,
}

impl StaffCredit {
    pub fn new(identity: Identity, role: Role) -> Self {
        Self {
            person: PersonFragment {
                identity,
                ..Default::default()
            },
            roles: RoleSet::from([role]),
        }
    }
}

/// A provider's partial answer for one game. Names live in `identity`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub identity: Identity,
    pub description: Option<String>,
    pub developer: Option<String>,
    pub cover_url: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub rating: Option<f32>,
    pub expected_play_hours: Option<f32>,
    pub tags: Option<Vec<String>>,
    pub characters: Option<Vec<Character>>,
    pub staff: Option<Vec<StaffCredit>>,
}

/// A merged value and the provider it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Field<T> {
    Placeholder,
    Known { value: T, source: SourceId },
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Placeholder
    }
}

impl<T> Field<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Known { value, .. } => Some(value),
            Field::Placeholder => None,
        }
    }

    pub fn source(&self) -> Option<SourceId> {
        match self {
            Field::Known { source, .. } => Some(*source),
            Field::Placeholder => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Field::Placeholder)
    }

    pub fn value_mut(&mut self) -> Option<&mut T> {
        match self {
            Field::Known { value, .. } => Some(value),
            Field::Placeholder => None,
        }
    }
}

/// The merged record for one game.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: Uuid,
    pub identity: Identity,
    pub name: Field<String>,
    pub localized_name: Field<String>,
    pub description: Field<String>,
    pub developer: Field<String>,
    pub cover_url: Field<String>,
    pub release_date: Field<NaiveDate>,
    pub rating: Field<f32>,
    pub expected_play_hours: Field<f32>,
    pub tags: Field<Vec<String>>,
    pub characters: Field<Vec<Character>>,
    pub staff: Field<Vec<StaffCredit>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A person in the shared roster. Games are referenced by id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: Uuid,
    pub identity: Identity,
    pub roles: RoleSet,
    pub game_links: BTreeMap<Uuid, RoleSet>,
    pub image_url: Option<String>,
    pub description: Option<String>,
}

impl PersonRecord {
    pub fn new(identity: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            roles: RoleSet::new(),
            game_links: BTreeMap::new(),
            image_url: None,
            description: None,
        }
    }

    pub fn needs_detail(&self) -> bool {
        !known_text(&self.image_url) && !known_text(&self.description)
    }

    pub fn apply_detail(&mut self, detail: &PersonFragment) {
        self.identity.absorb(&detail.identity);
        if known_text(&detail.image_url) {
            self.image_url = detail.image_url.clone();
        }
        if known_text(&detail.description) {
            self.description = detail.description.clone();
        }
    }
}

fn known_text(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !is_placeholder(v)).unwrap_or(false)
}
