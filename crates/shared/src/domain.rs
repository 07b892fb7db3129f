use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(CourseId);
id_newtype!(QuestionId);

/// Correlation id for one proctored session, carried through structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Question kinds as the grading service spells them on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionKind {
    #[serde(rename = "mcq")]
    SingleChoice,
    #[serde(rename = "msq")]
    MultiSelect,
    #[serde(rename = "tf")]
    TrueFalse,
    #[serde(rename = "text")]
    FreeText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    Visibility,
    Fullscreen,
    AudioLevel,
    FacePresence,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Visibility => "visibility",
            MonitorKind::Fullscreen => "fullscreen",
            MonitorKind::AudioLevel => "audio_level",
            MonitorKind::FacePresence => "face_presence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Loading,
    AwaitingStart,
    Active,
    Submitting,
    Completed,
    Failed,
}

/// A student's answer to one question. The JSON shape depends on the question
/// kind: a bare option index (`mcq`/`tf`), an index set (`msq`), or free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Choice(u32),
    Selection(Vec<u32>),
    Text(String),
}

/// One detected integrity anomaly. Append-only; never mutated or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub at: chrono::DateTime<chrono::Utc>,
    pub reason: String,
    pub source: MonitorKind,
}
