//! Core domain types for the Pedia corpus and its entity graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Relation type written by co-occurrence linking, backlink repair and link prediction.
pub const RELATED_TO: &str = "RELATED_TO";

/// Maximum slug length in characters.
const MAX_SLUG_LEN: usize = 100;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of an article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArticleStatus {
    Draft,
    Generating,
    Published,
    Error,
}

impl ArticleStatus {
    /// Column value stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Generating => "GENERATING",
            Self::Published => "PUBLISHED",
            Self::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for ArticleStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "GENERATING" => Ok(Self::Generating),
            "PUBLISHED" => Ok(Self::Published),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown article status: {other}")),
        }
    }
}

/// Category of a named entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Event,
    Concept,
    Work,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::Organization => "ORGANIZATION",
            Self::Location => "LOCATION",
            Self::Event => "EVENT",
            Self::Concept => "CONCEPT",
            Self::Work => "WORK",
            Self::Other => "OTHER",
        }
    }

    /// Lenient parse for provider output: unknown labels become [`EntityType::Other`].
    pub fn parse_lenient(s: &str) -> Self {
        s.trim().to_ascii_uppercase().parse().unwrap_or(Self::Other)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PERSON" => Ok(Self::Person),
            "ORGANIZATION" => Ok(Self::Organization),
            "LOCATION" => Ok(Self::Location),
            "EVENT" => Ok(Self::Event),
            "CONCEPT" => Ok(Self::Concept),
            "WORK" => Ok(Self::Work),
            "OTHER" => Ok(Self::Other),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A generated encyclopedia article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    /// Unique, derived from the title via [`slugify`].
    pub slug: String,
    pub title: String,
    pub content: String,
    pub status: ArticleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named entity; identity is `normalized_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    pub entity_type: EntityType,
}

/// Association between an article and an entity it mentions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleEntity {
    pub article_id: String,
    pub entity: Entity,
    pub relevance: f64,
}

/// Directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelation {
    pub id: String,
    pub from_entity_id: String,
    pub to_entity_id: String,
    pub relation_type: String,
    pub strength: f64,
}

impl EntityRelation {
    /// Whether `entity_id` is either endpoint.
    pub fn touches(&self, entity_id: &str) -> bool {
        self.from_entity_id == entity_id || self.to_entity_id == entity_id
    }
}

/// Entity candidate produced by extraction, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub relevance: f64,
}

/// A web source consulted while generating an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

// ---------------------------------------------------------------------------
// Names and slugs
// ---------------------------------------------------------------------------

/// Canonical entity identity: lowercase, trimmed.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Derive a URL slug: lowercase, accents stripped (NFD), runs of
/// non-alphanumeric characters collapsed to `-`, no leading/trailing dashes,
/// at most 100 characters.
///
/// Letters outside the Latin script are kept as-is, so `東京` slugs to
/// `東京` rather than to an empty string.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut len = 0;
    let mut pending_dash = false;

    let folded = text
        .nfd()
        .flat_map(char::to_lowercase)
        .filter(|c| !is_combining_mark(*c));

    'chars: for c in folded {
        if !c.is_alphanumeric() {
            pending_dash = true;
            continue;
        }
        if pending_dash && !slug.is_empty() {
            if len + 1 >= MAX_SLUG_LEN {
                break;
            }
            slug.push('-');
            len += 1;
        }
        pending_dash = false;
        for out in fold_letter(c) {
            if len == MAX_SLUG_LEN {
                break 'chars;
            }
            slug.push(out);
            len += 1;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Latin letters that have no NFD decomposition.
fn fold_letter(c: char) -> impl Iterator<Item = char> {
    let expanded: &'static str = match c {
        'æ' => "ae",
        'œ' => "oe",
        'ß' => "ss",
        'ø' => "o",
        'ł' => "l",
        'đ' | 'ð' => "d",
        'þ' => "th",
        'ı' => "i",
        _ => "",
    };
    let single = expanded.is_empty().then_some(c);
    expanded.chars().chain(single)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize_name("Marie Curie"), "marie curie");
        assert_eq!(normalize_name("  marie curie "), "marie curie");
    }

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Marie Curie"), "marie-curie");
        assert_eq!(slugify("  Paris, France! "), "paris-france");
        assert_eq!(slugify("Île-de-France"), "ile-de-france");
        assert_eq!(slugify("Gödel's theorem"), "godel-s-theorem");
    }

    #[test]
    fn slugify_folds_letters_without_decomposition() {
        assert_eq!(slugify("Cœur de Lœwe"), "coeur-de-loewe");
        assert_eq!(slugify("Straße"), "strasse");
        assert_eq!(slugify("Łódź"), "lodz");
        assert_eq!(slugify("Ærø"), "aero");
    }

    #[test]
    fn slugify_keeps_non_latin_scripts() {
        assert_eq!(slugify("東京"), "東京");
        assert_eq!(slugify("Москва, Россия"), "москва-россия");
        assert_eq!(slugify("القاهرة"), "القاهرة");
        assert!(slugify("!!! ???").is_empty());
    }

    #[test]
    fn slugify_matches_for_normalized_names() {
        assert_eq!(slugify(&normalize_name(" France ")), slugify("France"));
    }

    #[test]
    fn slugify_truncates() {
        let long = "word ".repeat(40);
        let slug = slugify(&long);
        assert!(slug.len() <= 100);
        assert!(!slug.ends_with('-'));

        let wide = slugify(&"東".repeat(150));
        assert_eq!(wide.chars().count(), 100);
    }

    #[test]
    fn entity_type_parsing() {
        assert_eq!("PERSON".parse::<EntityType>().unwrap(), EntityType::Person);
        assert_eq!(EntityType::parse_lenient("location"), EntityType::Location);
        assert_eq!(EntityType::parse_lenient("planet"), EntityType::Other);
        assert_eq!(EntityType::Organization.to_string(), "ORGANIZATION");
    }

    #[test]
    fn extracted_entity_uses_type_key() {
        let json = r#"{"name":"Paris","type":"LOCATION","relevance":0.9}"#;
        let parsed: ExtractedEntity = serde_json::from_str(json).expect("deserialize");
        assert_eq!(parsed.entity_type, EntityType::Location);
        let back = serde_json::to_string(&parsed).unwrap();
        assert!(back.contains(r#""type":"LOCATION""#));
    }

    #[test]
    fn relation_touches_either_end() {
        let rel = EntityRelation {
            id: "r1".into(),
            from_entity_id: "a".into(),
            to_entity_id: "b".into(),
            relation_type: RELATED_TO.into(),
            strength: 0.5,
        };
        assert!(rel.touches("a"));
        assert!(rel.touches("b"));
        assert!(!rel.touches("c"));
    }
}
