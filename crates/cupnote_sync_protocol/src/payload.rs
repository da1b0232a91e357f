//! Domain payloads carried inside [`SyncRecord`](crate::SyncRecord).
//!
//! The sync engine treats these as opaque; they live here so the app,
//! the backend client and the tests agree on one wire shape.

use crate::record::{RecordType, Timestamp};
use serde::{Deserialize, Serialize};

/// Serving temperature of a tasted coffee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Temperature {
    /// Served hot.
    #[default]
    Hot,
    /// Served iced.
    Ice,
}

/// One selection on the flavor wheel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorNote {
    /// Wheel depth, 1 (broad category) to 4 (specific flavor).
    pub level: u8,
    /// Flavor name at that level.
    pub value: String,
}

/// Sensory scores recorded for a tasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensoryAttributes {
    /// Body, 1-5.
    pub body: u8,
    /// Acidity, 1-5.
    pub acidity: u8,
    /// Sweetness, 1-5.
    pub sweetness: u8,
    /// Finish, 1-5.
    pub finish: u8,
    /// Free-form mouthfeel descriptor.
    pub mouthfeel: String,
}

/// A tasting note.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TastingPayload {
    /// Cafe where the coffee was tasted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cafe_name: Option<String>,
    /// Roastery.
    pub roastery: String,
    /// Coffee name.
    pub coffee_name: String,
    /// Origin country or region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Varietal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variety: Option<String>,
    /// Growing altitude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<String>,
    /// Processing method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    /// Serving temperature.
    #[serde(default)]
    pub temperature: Temperature,
    /// The roaster's published cup notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roaster_notes: Option<String>,
    /// How closely the taster's notes matched the roaster's, 0-100.
    #[serde(default)]
    pub match_score: u8,
    /// Flavor wheel selections.
    #[serde(default)]
    pub flavor_notes: Vec<FlavorNote>,
    /// Sensory scores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensory: Option<SensoryAttributes>,
}

impl TastingPayload {
    /// Creates a tasting with only the required fields set.
    pub fn new(roastery: impl Into<String>, coffee_name: impl Into<String>) -> Self {
        Self {
            roastery: roastery.into(),
            coffee_name: coffee_name.into(),
            ..Self::default()
        }
    }
}

/// Progress towards one achievement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementProgress {
    /// Achievement key, e.g. `first_tasting` or `flavor_explorer`.
    pub achievement_type: String,
    /// Level reached for tiered achievements.
    #[serde(default = "default_level")]
    pub level: u32,
    /// Completion ratio, 0.0-1.0.
    pub progress: f32,
    /// Whether the achievement is unlocked.
    pub is_unlocked: bool,
    /// When it was unlocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocked_at: Option<Timestamp>,
}

fn default_level() -> u32 {
    1
}

/// Flavor-identification practice statistics for one flavor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningProgress {
    /// Top-level flavor category, e.g. `fruity`.
    pub flavor_category: String,
    /// Optional subcategory, e.g. `citrus`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor_subcategory: Option<String>,
    /// Times the flavor was presented.
    pub exposure_count: u32,
    /// Times the flavor was identified correctly.
    pub identification_count: u32,
    /// Last practice session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_practiced_at: Option<Timestamp>,
}

impl LearningProgress {
    /// Ratio of correct identifications, 0.0 when never practiced.
    pub fn accuracy(&self) -> f32 {
        if self.exposure_count == 0 {
            0.0
        } else {
            self.identification_count as f32 / self.exposure_count as f32
        }
    }
}

/// Payload of any journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalPayload {
    /// A tasting note.
    Tasting(TastingPayload),
    /// Achievement progress.
    Achievement(AchievementProgress),
    /// Learning progress.
    Learning(LearningProgress),
}

impl JournalPayload {
    /// Returns the record type this payload belongs to.
    pub fn record_type(&self) -> RecordType {
        match self {
            JournalPayload::Tasting(_) => RecordType::Tasting,
            JournalPayload::Achievement(_) => RecordType::AchievementProgress,
            JournalPayload::Learning(_) => RecordType::LearningProgress,
        }
    }
}

impl From<TastingPayload> for JournalPayload {
    fn from(payload: TastingPayload) -> Self {
        JournalPayload::Tasting(payload)
    }
}

impl From<AchievementProgress> for JournalPayload {
    fn from(payload: AchievementProgress) -> Self {
        JournalPayload::Achievement(payload)
    }
}

impl From<LearningProgress> for JournalPayload {
    fn from(payload: LearningProgress) -> Self {
        JournalPayload::Learning(payload)
    }
}

/// A place the user's tastings point to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueKind {
    /// A cafe the user tasted at.
    Cafe,
    /// A roastery whose coffee the user tasted.
    Roaster,
}

impl VenueKind {
    /// Backend procedure that adds one visit to the user's counter.
    pub fn procedure(&self) -> &'static str {
        match self {
            VenueKind::Cafe => "increment_cafe_visit",
            VenueKind::Roaster => "increment_roaster_visit",
        }
    }

    /// Name of the procedure argument carrying the venue name.
    pub fn name_param(&self) -> &'static str {
        match self {
            VenueKind::Cafe => "cafe_name_param",
            VenueKind::Roaster => "roaster_name_param",
        }
    }
}

/// Visits to one venue recorded on this device and not yet counted by
/// the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueVisits {
    /// Cafe or roaster.
    pub kind: VenueKind,
    /// Venue name as entered in tastings.
    pub name: String,
    /// Visits still to push.
    pub pending: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasting_skips_empty_optionals() {
        let tasting = TastingPayload::new("Fritz", "Ethiopia Guji");
        let json = serde_json::to_value(&tasting).unwrap();

        assert_eq!(json["roastery"], "Fritz");
        assert_eq!(json["temperature"], "hot");
        assert!(json.get("cafe_name").is_none());
        assert!(json.get("sensory").is_none());
    }

    #[test]
    fn journal_payload_is_tagged() {
        let payload = JournalPayload::from(AchievementProgress {
            achievement_type: "first_tasting".into(),
            level: 1,
            progress: 1.0,
            is_unlocked: true,
            unlocked_at: None,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "achievement");
        assert_eq!(payload.record_type(), RecordType::AchievementProgress);

        let back: JournalPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn tasting_decodes_sparse_row() {
        let json = r#"{"kind":"tasting","roastery":"Momos","coffee_name":"Kenya AA","temperature":"ice"}"#;
        let payload: JournalPayload = serde_json::from_str(json).unwrap();
        match payload {
            JournalPayload::Tasting(t) => {
                assert_eq!(t.temperature, Temperature::Ice);
                assert!(t.flavor_notes.is_empty());
                assert_eq!(t.match_score, 0);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn learning_accuracy() {
        let mut progress = LearningProgress {
            flavor_category: "fruity".into(),
            flavor_subcategory: Some("citrus".into()),
            exposure_count: 0,
            identification_count: 0,
            last_practiced_at: None,
        };
        assert_eq!(progress.accuracy(), 0.0);

        progress.exposure_count = 4;
        progress.identification_count = 3;
        assert!((progress.accuracy() - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn venue_procedures() {
        assert_eq!(VenueKind::Cafe.procedure(), "increment_cafe_visit");
        assert_eq!(VenueKind::Roaster.name_param(), "roaster_name_param");
        assert_eq!(serde_json::to_value(VenueKind::Roaster).unwrap(), "roaster");
    }
}
