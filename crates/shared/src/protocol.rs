use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{AnswerValue, QuestionId, QuestionKind};

/// Question id → answer value. Insertion order carries no meaning.
pub type AnswerMap = HashMap<QuestionId, AnswerValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    #[serde(rename = "question")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Exam definition as served by the grading service. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamDefinition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub time_limit_minutes: u32,
    pub questions: Vec<Question>,
}

impl ExamDefinition {
    pub fn time_limit_seconds(&self) -> u64 {
        u64::from(self.time_limit_minutes) * 60
    }
}

/// Evidence payload posted to the grading service, built exactly once per
/// session immediately before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitExamRequest {
    pub items: AnswerMap,
    pub proctor_logs: Vec<String>,
    pub malpractice_count: u32,
    pub time_taken_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerAnalysis {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_answer: Option<AnswerValue>,
    pub correct: bool,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamResultResponse {
    pub score: f64,
    pub total_points: f64,
    pub percentage: f64,
    pub passed: bool,
    pub credibility_score: f64,
    pub malpractice_count: u32,
    pub attempts: u32,
    pub analysis: Vec<AnswerAnalysis>,
}
