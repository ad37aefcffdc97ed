use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::platform::PlatformId;

/// One application target. Created by the (external) scraper and never mutated
/// by the engine; workers hold it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub url: String,
    /// Platform hint from the source, if any. The router still has the last word.
    #[serde(default)]
    pub platform_hint: Option<PlatformId>,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub title: String,
}

impl Job {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            platform_hint: None,
            company: String::new(),
            title: String::new(),
        }
    }

    pub fn with_meta(mut self, company: impl Into<String>, title: impl Into<String>) -> Self {
        self.company = company.into();
        self.title = title.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Short label for logs: "title @ company", falling back to the URL.
    pub fn label(&self) -> String {
        if self.title.is_empty() && self.company.is_empty() {
            self.url.clone()
        } else {
            format!("{} @ {}", self.title, self.company)
        }
    }
}

/// Scheduling class derived from the resolved platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PriorityClass {
    pub category_rank: u8,
    pub platform_priority: u32,
}

impl PriorityClass {
    pub fn for_platform(platform: PlatformId) -> Self {
        Self {
            category_rank: platform.category().rank(),
            platform_priority: platform.priority(),
        }
    }
}

/// Category of a free-text question, used to look up pre-written answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerCategory {
    WorkAuthorization,
    Sponsorship,
    YearsExperience,
    SalaryExpectation,
    StartDate,
    Relocation,
    CoverLetter,
    Other,
}

impl AnswerCategory {
    /// Guess the category of a question from its label text.
    pub fn infer(question: &str) -> Self {
        let q = question.to_lowercase();
        if q.contains("sponsor") {
            AnswerCategory::Sponsorship
        } else if q.contains("authorized") || q.contains("authorised") || q.contains("eligible to work")
        {
            AnswerCategory::WorkAuthorization
        } else if q.contains("years") && q.contains("experience") {
            AnswerCategory::YearsExperience
        } else if q.contains("salary") || q.contains("compensation") {
            AnswerCategory::SalaryExpectation
        } else if q.contains("start date") || q.contains("notice period") || q.contains("when can you start") {
            AnswerCategory::StartDate
        } else if q.contains("relocat") {
            AnswerCategory::Relocation
        } else if q.contains("cover letter") || q.contains("why do you want") {
            AnswerCategory::CoverLetter
        } else {
            AnswerCategory::Other
        }
    }
}

/// Path to the résumé file uploaded with each application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeRef(pub PathBuf);

/// The applicant. Owned by the caller; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    pub resume: ResumeRef,
    #[serde(default)]
    pub answers: HashMap<AnswerCategory, String>,
}

impl CandidateProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn answer_for(&self, category: AnswerCategory) -> Option<&str> {
        self.answers
            .get(&category)
            .map(String::as_str)
            .filter(|a| !a.trim().is_empty())
    }

    /// One-paragraph summary handed to the answer generator as context.
    pub fn context_summary(&self) -> String {
        let mut summary = format!("Candidate: {}.", self.full_name());
        if !self.location.is_empty() {
            summary.push_str(&format!(" Location: {}.", self.location));
        }
        if let Some(years) = self.answer_for(AnswerCategory::YearsExperience) {
            summary.push_str(&format!(" Years of experience: {years}."));
        }
        if let Some(auth) = self.answer_for(AnswerCategory::WorkAuthorization) {
            summary.push_str(&format!(" Work authorization: {auth}."));
        }
        summary
    }
}
