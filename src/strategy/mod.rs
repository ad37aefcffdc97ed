//! Form strategies: one per platform family, sharing a common contract.
//!
//! A strategy never owns the page. The executor drives it through
//! `navigate → fill_fields → advance* → submit → verify_success` and
//! records one state-machine step per call.

pub mod complex;
pub mod direct;
pub mod generic;
pub mod native;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorClass;
use crate::provider::{Action, BrowserPage, ExtractSchema, ProviderError, SelectorChain};
use crate::state_machine::{CandidateProfile, Confirmation, Job};

pub use complex::ComplexFormStrategy;
pub use direct::DirectApplyStrategy;
pub use generic::GenericStrategy;
pub use native::NativeFlowStrategy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationResult {
    FormReached,
    AlreadyApplied,
    NoApplicationPath(String),
    PositionClosed(String),
    /// CAPTCHA or anti-bot interstitial.
    Challenge(String),
}

/// A question the strategy could not answer from the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenQuestion {
    pub label: String,
    pub selector: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillResult {
    pub filled: Vec<String>,
    pub missing_required: Vec<String>,
    pub open_questions: Vec<OpenQuestion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Another page of fields is showing.
    Advanced,
    Review,
    /// Ready to submit.
    Complete,
    Terminated(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Clicked,
    HeldForReview,
    NoSubmitControl,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("form mismatch: {0}")]
    Structural(String),

    #[error("anti-bot challenge: {0}")]
    AntiBot(String),

    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl StrategyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StrategyError::Transient(_) => ErrorClass::Transient,
            StrategyError::Structural(_) | StrategyError::Unexpected(_) => ErrorClass::Structural,
            StrategyError::AntiBot(_) => ErrorClass::AntiBot,
        }
    }
}

impl From<ProviderError> for StrategyError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Protocol(msg) => StrategyError::Unexpected(msg),
            other => StrategyError::Transient(other.to_string()),
        }
    }
}

#[async_trait]
pub trait FormStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn navigate(
        &self,
        page: &dyn BrowserPage,
        job: &Job,
    ) -> Result<NavigationResult, StrategyError>;

    async fn fill_fields(
        &self,
        page: &dyn BrowserPage,
        profile: &CandidateProfile,
    ) -> Result<FillResult, StrategyError>;

    async fn fill_answer(
        &self,
        page: &dyn BrowserPage,
        question: &OpenQuestion,
        answer: &str,
    ) -> Result<(), StrategyError> {
        let chain = SelectorChain(vec![question.selector.clone()]);
        if fill_chain(page, &chain, answer).await? {
            Ok(())
        } else {
            Err(StrategyError::Structural(format!(
                "answer control for '{}' disappeared",
                question.label
            )))
        }
    }

    async fn advance(&self, page: &dyn BrowserPage) -> Result<StepResult, StrategyError>;

    async fn submit(
        &self,
        page: &dyn BrowserPage,
        authorized: bool,
    ) -> Result<SubmitResult, StrategyError>;

    /// `None` means unconfirmed, never success. `submitted_from` is the page
    /// URL at the moment the submit control was clicked.
    async fn verify_success(
        &self,
        page: &dyn BrowserPage,
        submitted_from: &str,
    ) -> Result<Option<Confirmation>, StrategyError>;
}

/// Profile fields a layout knows how to place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    /// Single "name" control (Ashby).
    FullName,
    FirstName,
    LastName,
    Email,
    Phone,
    Location,
    LinkedIn,
    Website,
}

impl ProfileField {
    pub fn name(self) -> &'static str {
        match self {
            ProfileField::FullName => "full_name",
            ProfileField::FirstName => "first_name",
            ProfileField::LastName => "last_name",
            ProfileField::Email => "email",
            ProfileField::Phone => "phone",
            ProfileField::Location => "location",
            ProfileField::LinkedIn => "linkedin",
            ProfileField::Website => "website",
        }
    }

    pub fn required(self) -> bool {
        matches!(
            self,
            ProfileField::FullName
                | ProfileField::FirstName
                | ProfileField::LastName
                | ProfileField::Email
        )
    }

    fn value(self, profile: &CandidateProfile) -> Option<String> {
        let v = match self {
            ProfileField::FullName => profile.full_name(),
            ProfileField::FirstName => profile.first_name.clone(),
            ProfileField::LastName => profile.last_name.clone(),
            ProfileField::Email => profile.email.clone(),
            ProfileField::Phone => profile.phone.clone(),
            ProfileField::Location => profile.location.clone(),
            ProfileField::LinkedIn => profile.linkedin_url.clone().unwrap_or_default(),
            ProfileField::Website => profile.website.clone().unwrap_or_default(),
        };
        (!v.trim().is_empty()).then_some(v)
    }
}

/// Indicators that the platform accepted an application.
pub struct SuccessMarkers {
    pub selectors: SelectorChain,
    pub phrases: &'static [&'static str],
    pub url_tokens: &'static [&'static str],
}

/// Static description of one platform's form.
pub struct FormLayout {
    pub apply_button: SelectorChain,
    pub fields: Vec<(ProfileField, SelectorChain)>,
    pub resume: SelectorChain,
    pub next: SelectorChain,
    pub review: SelectorChain,
    pub submit: SelectorChain,
    /// Inline validation errors that block advancing.
    pub validation_errors: SelectorChain,
    pub already_applied: &'static [&'static str],
    pub closed: &'static [&'static str],
    pub success: SuccessMarkers,
}

pub(crate) static CHALLENGE_SELECTORS: LazyLock<SelectorChain> = LazyLock::new(|| {
    SelectorChain::new(&[
        ".captcha-wrapper",
        ".challenge-dialog",
        r#"iframe[src*="captcha"]"#,
        r#"iframe[src*="challenge"]"#,
        r#"input[name="captchaResponse"]"#,
        ".g-recaptcha",
        ".h-captcha",
    ])
});

static ERROR_SELECTORS: LazyLock<SelectorChain> = LazyLock::new(|| {
    SelectorChain::new(&[".error-message", ".form-error", ".alert-error", r#"[data-testid="error"]"#])
});

static CONFIRMATION_ID: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i:confirmation)[\s#:]+(?:(?i:number|id|code)[\s#:]*)?([A-Z0-9][A-Z0-9\-]{3,})",
        r"(?i:reference)[\s#:]+(?:(?i:number|id|code)[\s#:]*)?([A-Z0-9][A-Z0-9\-]{3,})",
        r"(?i:application)[\s#:]+(?i:number|id)[\s#:]*([A-Z0-9][A-Z0-9\-]{3,})",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Locate the chain's first matching element and fill it.
pub async fn fill_chain(
    page: &dyn BrowserPage,
    chain: &SelectorChain,
    value: &str,
) -> Result<bool, StrategyError> {
    if chain.is_empty() {
        return Ok(false);
    }
    match page.locate(chain).await? {
        Some(el) => {
            page.act(&el, Action::Fill, Some(value)).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub async fn click_chain(page: &dyn BrowserPage, chain: &SelectorChain) -> Result<bool, StrategyError> {
    if chain.is_empty() {
        return Ok(false);
    }
    match page.locate(chain).await? {
        Some(el) => {
            page.act(&el, Action::Click, None).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub async fn is_present(page: &dyn BrowserPage, chain: &SelectorChain) -> Result<bool, StrategyError> {
    if chain.is_empty() {
        return Ok(false);
    }
    Ok(page.locate(chain).await?.is_some())
}

pub async fn page_text(page: &dyn BrowserPage) -> Result<String, StrategyError> {
    let value = page.extract(&ExtractSchema::PageText).await?;
    Ok(value.as_str().unwrap_or_default().to_string())
}

pub async fn read_open_questions(page: &dyn BrowserPage) -> Result<Vec<OpenQuestion>, StrategyError> {
    let value = page.extract(&ExtractSchema::OpenQuestions).await?;
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value)
        .map_err(|e| StrategyError::Unexpected(format!("malformed open questions: {e}")))
}

pub async fn has_challenge(page: &dyn BrowserPage) -> Result<bool, StrategyError> {
    is_present(page, &CHALLENGE_SELECTORS).await
}

fn contains_any(haystack_lower: &str, needles: &[&str]) -> Option<String> {
    needles
        .iter()
        .find(|n| haystack_lower.contains(&n.to_lowercase()))
        .map(|n| n.to_string())
}

/// Common landing-page checks after `navigate`: challenge, already applied,
/// closed posting. `None` when none apply.
pub async fn screen_landing(
    page: &dyn BrowserPage,
    layout: &FormLayout,
) -> Result<Option<NavigationResult>, StrategyError> {
    if has_challenge(page).await? {
        return Ok(Some(NavigationResult::Challenge("captcha on landing page".into())));
    }
    let text = page_text(page).await?.to_lowercase();
    if contains_any(&text, layout.already_applied).is_some() {
        return Ok(Some(NavigationResult::AlreadyApplied));
    }
    if let Some(phrase) = contains_any(&text, layout.closed) {
        return Ok(Some(NavigationResult::PositionClosed(phrase)));
    }
    Ok(None)
}

/// Whether the application form itself is on screen: any required field
/// control can be located.
pub async fn form_visible(page: &dyn BrowserPage, layout: &FormLayout) -> Result<bool, StrategyError> {
    for (field, chain) in &layout.fields {
        if field.required() && is_present(page, chain).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Reach the form from the landing page: already there, or one click on the
/// apply button away.
pub async fn reach_form(
    page: &dyn BrowserPage,
    layout: &FormLayout,
) -> Result<NavigationResult, StrategyError> {
    if form_visible(page, layout).await? {
        return Ok(NavigationResult::FormReached);
    }
    if !click_chain(page, &layout.apply_button).await? {
        return Ok(NavigationResult::NoApplicationPath(
            "no application form or apply button".into(),
        ));
    }
    if has_challenge(page).await? {
        return Ok(NavigationResult::Challenge("captcha after apply click".into()));
    }
    if form_visible(page, layout).await? {
        Ok(NavigationResult::FormReached)
    } else {
        Ok(NavigationResult::NoApplicationPath(
            "apply button did not open a form".into(),
        ))
    }
}

/// One step of a paged form: submit control visible means complete,
/// otherwise prefer the review button over next.
pub async fn advance_with(
    page: &dyn BrowserPage,
    layout: &FormLayout,
) -> Result<StepResult, StrategyError> {
    if has_challenge(page).await? {
        return Err(StrategyError::AntiBot("captcha inside application flow".into()));
    }
    if is_present(page, &layout.validation_errors).await? {
        return Ok(StepResult::Terminated("validation errors on page".into()));
    }
    if is_present(page, &layout.submit).await? {
        return Ok(StepResult::Complete);
    }
    if click_chain(page, &layout.review).await? {
        return Ok(StepResult::Review);
    }
    if click_chain(page, &layout.next).await? {
        return Ok(StepResult::Advanced);
    }
    Ok(StepResult::Terminated("no navigation control on page".into()))
}

/// Fill every profile field the layout knows about, upload the résumé and
/// collect the questions left open.
pub async fn fill_profile(
    page: &dyn BrowserPage,
    layout: &FormLayout,
    profile: &CandidateProfile,
) -> Result<FillResult, StrategyError> {
    let mut result = FillResult::default();
    for (field, chain) in &layout.fields {
        let Some(value) = field.value(profile) else {
            if field.required() {
                result.missing_required.push(field.name().to_string());
            }
            continue;
        };
        if fill_chain(page, chain, &value).await? {
            result.filled.push(field.name().to_string());
        } else if field.required() {
            result.missing_required.push(field.name().to_string());
        }
    }

    if !layout.resume.is_empty() {
        match page.locate(&layout.resume).await? {
            Some(el) => {
                let path = profile.resume.0.to_string_lossy();
                page.act(&el, Action::Upload, Some(&path)).await?;
                result.filled.push("resume".to_string());
            }
            None => debug!("no resume control on this page"),
        }
    }

    result.open_questions = read_open_questions(page).await?;
    Ok(result)
}

pub async fn submit_with(
    page: &dyn BrowserPage,
    chain: &SelectorChain,
    authorized: bool,
) -> Result<SubmitResult, StrategyError> {
    if !authorized {
        return Ok(SubmitResult::HeldForReview);
    }
    if click_chain(page, chain).await? {
        Ok(SubmitResult::Clicked)
    } else {
        Ok(SubmitResult::NoSubmitControl)
    }
}

/// Look for positive evidence of acceptance. Error banners veto every
/// other indicator.
///
/// A URL token only counts when the page moved away from `submitted_from`
/// and the token was not already part of that URL.
pub async fn detect_success(
    page: &dyn BrowserPage,
    markers: &SuccessMarkers,
    submitted_from: &str,
) -> Result<Option<Confirmation>, StrategyError> {
    if is_present(page, &ERROR_SELECTORS).await? {
        return Ok(None);
    }
    let text = page_text(page).await?;
    let lower = text.to_lowercase();

    let indicator = if let Some(el) = page.locate(&markers.selectors).await? {
        Some(format!("selector: {}", el.selector))
    } else if let Some(phrase) = contains_any(&lower, markers.phrases) {
        Some(format!("text: {phrase}"))
    } else {
        let url = page.current_url().await?.to_lowercase();
        let before = submitted_from.to_lowercase();
        if url == before {
            None
        } else {
            let (now, then) = (path_and_query(&url), path_and_query(&before));
            markers
                .url_tokens
                .iter()
                .find(|t| now.contains(*t) && !then.contains(*t))
                .map(|t| format!("url: {t}"))
        }
    };

    Ok(indicator.map(|indicator| Confirmation {
        indicator,
        confirmation_id: extract_confirmation_id(&text),
    }))
}

fn path_and_query(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| format!("{}?{}", u.path(), u.query().unwrap_or_default()))
        .unwrap_or_else(|_| url.to_string())
}

/// First id-looking token after "confirmation", "reference" or
/// "application number". Ids must contain a digit.
pub fn extract_confirmation_id(text: &str) -> Option<String> {
    CONFIRMATION_ID
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|id| id.chars().any(|c| c.is_ascii_digit()))
        .map(str::to_string)
}
