//! Single-page ATS forms reachable straight from the job URL.

use async_trait::async_trait;
use tracing::debug;

use super::{
    FillResult, FormLayout, FormStrategy, NavigationResult, ProfileField, StepResult,
    StrategyError, SubmitResult, SuccessMarkers, advance_with, detect_success, fill_profile,
    reach_form, screen_landing, submit_with,
};
use crate::platform::PlatformId;
use crate::provider::{BrowserPage, SelectorChain};
use crate::state_machine::{CandidateProfile, Confirmation, Job};

const CLOSED: &[&str] = &[
    "no longer accepting applications",
    "job is no longer available",
    "position has been filled",
    "this job has expired",
];

const ALREADY_APPLIED: &[&str] = &[
    "you have already applied",
    "already submitted an application",
];

/// Greenhouse, Lever and Ashby: one page of fields and a submit button.
pub struct DirectApplyStrategy {
    platform: PlatformId,
    layout: FormLayout,
}

impl DirectApplyStrategy {
    pub fn for_platform(platform: PlatformId) -> Option<Self> {
        let layout = match platform {
            PlatformId::Greenhouse => greenhouse(),
            PlatformId::Lever => lever(),
            PlatformId::Ashby => ashby(),
            _ => return None,
        };
        Some(Self { platform, layout })
    }

    pub fn platform(&self) -> PlatformId {
        self.platform
    }
}

fn chain(group: &str) -> SelectorChain {
    SelectorChain::parse(group)
}

fn greenhouse() -> FormLayout {
    FormLayout {
        apply_button: chain(r#".apply-button, #apply_button, a[href*="/apply"]"#),
        fields: vec![
            (ProfileField::FirstName, chain(r#"#first_name, input[name="first_name"]"#)),
            (ProfileField::LastName, chain(r#"#last_name, input[name="last_name"]"#)),
            (
                ProfileField::Email,
                chain(r#"#email, input[name="email"], input[type="email"]"#),
            ),
            (
                ProfileField::Phone,
                chain(r#"#phone, input[name="phone"], input[type="tel"]"#),
            ),
            (
                ProfileField::LinkedIn,
                chain(r#"input[autocomplete="custom-question-linkedin-profile"], input[name*="linkedin"]"#),
            ),
            (ProfileField::Website, chain(r#"input[name*="website"]"#)),
        ],
        resume: chain(r#"input[type="file"]"#),
        next: SelectorChain::default(),
        review: SelectorChain::default(),
        submit: chain(r#"#submit_app, input[type="submit"], button[type="submit"]"#),
        validation_errors: chain(".field-error, #error_explanation"),
        already_applied: ALREADY_APPLIED,
        closed: CLOSED,
        success: SuccessMarkers {
            selectors: chain(".thank-you, .confirmation, .applied, .success-message"),
            phrases: &[
                "thank you for applying",
                "application has been submitted",
                "application received",
            ],
            url_tokens: &["applied", "success", "confirmation"],
        },
    }
}

fn lever() -> FormLayout {
    FormLayout {
        apply_button: chain(r#".posting-btn-apply, a[href*="/apply"]"#),
        fields: vec![
            (
                ProfileField::FullName,
                chain(r#"input[name="name"], input[name="fullName"]"#),
            ),
            (
                ProfileField::Email,
                chain(r#"input[name="email"], input[type="email"], #email"#),
            ),
            (
                ProfileField::Phone,
                chain(r#"input[name="phone"], input[type="tel"], #phone"#),
            ),
            (ProfileField::Location, chain(r#"input[name="location"]"#)),
            (
                ProfileField::LinkedIn,
                chain(r#"input[name="urls[LinkedIn]"], input[name="linkedin"]"#),
            ),
            (
                ProfileField::Website,
                chain(r#"input[name="urls[Portfolio]"], input[name="portfolio"]"#),
            ),
        ],
        resume: chain(r#"input[name="resume"], input[type="file"], #resume"#),
        next: SelectorChain::default(),
        review: SelectorChain::default(),
        submit: chain(r#"button[type="submit"], .posting-btn-submit"#),
        validation_errors: chain(".application-error, .error-message"),
        already_applied: ALREADY_APPLIED,
        closed: CLOSED,
        success: SuccessMarkers {
            selectors: chain(".confirmation, .success, .thank-you"),
            phrases: &["application submitted", "thank you for applying", "application received"],
            url_tokens: &["thanks", "success", "confirmation"],
        },
    }
}

fn ashby() -> FormLayout {
    FormLayout {
        apply_button: chain(r#"a[href*="/application"], .ashby-job-posting-apply-button"#),
        fields: vec![
            (ProfileField::FullName, chain(r#"input[name="_systemfield_name"]"#)),
            (
                ProfileField::Email,
                chain(r#"input[name="_systemfield_email"], input[type="email"]"#),
            ),
            (ProfileField::Phone, chain(r#"input[type="tel"]"#)),
            (ProfileField::LinkedIn, chain(r#"input[name*="linkedin" i]"#)),
        ],
        resume: chain(r#"input[id="_systemfield_resume"], input[type="file"]"#),
        next: SelectorChain::default(),
        review: SelectorChain::default(),
        submit: chain(r#".ashby-application-form-submit-button, button[type="submit"]"#),
        validation_errors: chain(".ashby-application-form-field-error"),
        already_applied: ALREADY_APPLIED,
        closed: CLOSED,
        success: SuccessMarkers {
            selectors: chain(".ashby-application-form-success-container"),
            phrases: &["thanks for applying", "application was successfully submitted"],
            url_tokens: &["success", "confirmation"],
        },
    }
}

#[async_trait]
impl FormStrategy for DirectApplyStrategy {
    fn name(&self) -> &'static str {
        "direct_apply"
    }

    async fn navigate(
        &self,
        page: &dyn BrowserPage,
        job: &Job,
    ) -> Result<NavigationResult, StrategyError> {
        page.navigate(&job.url).await?;
        if let Some(early) = screen_landing(page, &self.layout).await? {
            debug!(platform = %self.platform, ?early, "landing page screened out");
            return Ok(early);
        }
        reach_form(page, &self.layout).await
    }

    async fn fill_fields(
        &self,
        page: &dyn BrowserPage,
        profile: &CandidateProfile,
    ) -> Result<FillResult, StrategyError> {
        fill_profile(page, &self.layout, profile).await
    }

    async fn advance(&self, page: &dyn BrowserPage) -> Result<StepResult, StrategyError> {
        advance_with(page, &self.layout).await
    }

    async fn submit(
        &self,
        page: &dyn BrowserPage,
        authorized: bool,
    ) -> Result<SubmitResult, StrategyError> {
        submit_with(page, &self.layout.submit, authorized).await
    }

    async fn verify_success(
        &self,
        page: &dyn BrowserPage,
        submitted_from: &str,
    ) -> Result<Option<Confirmation>, StrategyError> {
        detect_success(page, &self.layout.success, submitted_from).await
    }
}
