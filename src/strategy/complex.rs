//! Multi-page enterprise ATS wizards (Workday, Taleo).

use async_trait::async_trait;
use tracing::debug;

use super::{
    FillResult, FormLayout, FormStrategy, NavigationResult, ProfileField, StepResult,
    StrategyError, SubmitResult, SuccessMarkers, advance_with, click_chain, detect_success,
    fill_profile, form_visible, has_challenge, is_present, screen_landing, submit_with,
};
use crate::platform::PlatformId;
use crate::provider::{BrowserPage, SelectorChain};
use crate::state_machine::{CandidateProfile, Confirmation, Job};

pub struct ComplexFormStrategy {
    platform: PlatformId,
    layout: FormLayout,
    /// "Apply manually" style link shown after the first apply click.
    manual_entry: SelectorChain,
    /// Sign-in / create-account gate.
    account_wall: SelectorChain,
}

impl ComplexFormStrategy {
    pub fn for_platform(platform: PlatformId) -> Option<Self> {
        let (layout, manual_entry, account_wall) = match platform {
            PlatformId::Workday => workday(),
            PlatformId::Taleo => taleo(),
            _ => return None,
        };
        Some(Self {
            platform,
            layout,
            manual_entry,
            account_wall,
        })
    }

    pub fn platform(&self) -> PlatformId {
        self.platform
    }
}

fn chain(group: &str) -> SelectorChain {
    SelectorChain::parse(group)
}

fn workday() -> (FormLayout, SelectorChain, SelectorChain) {
    let layout = FormLayout {
        apply_button: chain(
            r#"a[data-automation-id="adventureButton"], button[data-automation-id="applyButton"]"#,
        ),
        fields: vec![
            (
                ProfileField::FirstName,
                chain(r#"input[data-automation-id="legalNameSection_firstName"], input[data-automation-id="firstName"], input[name="firstName"]"#),
            ),
            (
                ProfileField::LastName,
                chain(r#"input[data-automation-id="legalNameSection_lastName"], input[data-automation-id="lastName"], input[name="lastName"]"#),
            ),
            (
                ProfileField::Email,
                chain(r#"input[data-automation-id="email"], input[name="email"], input[type="email"]"#),
            ),
            (
                ProfileField::Phone,
                chain(r#"input[data-automation-id="phone-number"], input[data-automation-id="phone"], input[type="tel"]"#),
            ),
            (
                ProfileField::Location,
                chain(r#"input[data-automation-id="addressSection_city"], input[data-automation-id="city"]"#),
            ),
        ],
        resume: chain(r#"input[data-automation-id="file-upload-input-ref"], input[type="file"]"#),
        next: chain(
            r#"button[data-automation-id="bottom-navigation-next-button"], button[data-automation-id="next"]"#,
        ),
        review: chain(r#"button[data-automation-id="bottom-navigation-review-button"]"#),
        submit: chain(
            r#"button[data-automation-id="bottom-navigation-submit-button"], button[data-automation-id="submit"]"#,
        ),
        validation_errors: chain(r#"[data-automation-id="errorMessage"]"#),
        already_applied: &["you have already applied for this job"],
        closed: &["the page you are looking for doesn't exist", "job posting is no longer available"],
        success: SuccessMarkers {
            selectors: chain(
                r#"[data-automation-id="applicationSubmitted"], .wd-application-submitted, .confirmation-message"#,
            ),
            phrases: &["application submitted", "thank you"],
            url_tokens: &["submitted", "confirmation", "success"],
        },
    };
    let manual = chain(r#"a[data-automation-id="applyManually"]"#);
    let wall = chain(
        r#"[data-automation-id="createAccountLink"], [data-automation-id="signInLink"], button[data-automation-id="createAccountSubmitButton"]"#,
    );
    (layout, manual, wall)
}

fn taleo() -> (FormLayout, SelectorChain, SelectorChain) {
    let layout = FormLayout {
        apply_button: chain(r#"a[id*="applyButton"], a.applyButton"#),
        fields: vec![
            (ProfileField::FirstName, chain(r#"input#firstname, input[id*="FirstName"]"#)),
            (ProfileField::LastName, chain(r#"input#lastname, input[id*="LastName"]"#)),
            (ProfileField::Email, chain(r#"input#email, input[id*="EmailAddress"]"#)),
            (ProfileField::Phone, chain(r#"input#phone, input[id*="Phone"]"#)),
        ],
        resume: chain(r#"input[type="file"]"#),
        next: chain(r#"input[value="Save and Continue"], #et-ef-content-ftf-saveContinueCmdBottom"#),
        review: chain(r#"input[value="Review"]"#),
        submit: chain(r#"input[value="Submit"], #et-ef-content-ftf-submitCmdBottom"#),
        validation_errors: chain(".errorMessage, .error-text"),
        already_applied: &["you have already applied"],
        closed: &["job is no longer available", "position is closed"],
        success: SuccessMarkers {
            selectors: chain(".confirmation, .thankyou"),
            phrases: &["thank you for applying", "submission complete"],
            url_tokens: &["confirmation", "thankyou"],
        },
    };
    let manual = SelectorChain::default();
    let wall = chain(r#"#loginField, input[id*="login"], a[id*="newUser"]"#);
    (layout, manual, wall)
}

#[async_trait]
impl FormStrategy for ComplexFormStrategy {
    fn name(&self) -> &'static str {
        "complex_form"
    }

    async fn navigate(
        &self,
        page: &dyn BrowserPage,
        job: &Job,
    ) -> Result<NavigationResult, StrategyError> {
        page.navigate(&job.url).await?;
        if let Some(early) = screen_landing(page, &self.layout).await? {
            return Ok(early);
        }
        if form_visible(page, &self.layout).await? {
            return Ok(NavigationResult::FormReached);
        }
        if !click_chain(page, &self.layout.apply_button).await? {
            return Ok(NavigationResult::NoApplicationPath("no apply button".into()));
        }
        if click_chain(page, &self.manual_entry).await? {
            debug!(platform = %self.platform, "chose manual application entry");
        }
        if has_challenge(page).await? {
            return Ok(NavigationResult::Challenge("captcha after apply click".into()));
        }
        if form_visible(page, &self.layout).await? {
            return Ok(NavigationResult::FormReached);
        }
        if is_present(page, &self.account_wall).await? {
            return Ok(NavigationResult::NoApplicationPath(
                "account required before applying".into(),
            ));
        }
        Ok(NavigationResult::NoApplicationPath(
            "apply flow did not reach a form".into(),
        ))
    }

    async fn fill_fields(
        &self,
        page: &dyn BrowserPage,
        profile: &CandidateProfile,
    ) -> Result<FillResult, StrategyError> {
        let mut result = fill_profile(page, &self.layout, profile).await?;
        // Wizard pages past "My Information" carry no contact fields.
        if !form_visible(page, &self.layout).await? {
            result.missing_required.clear();
        }
        Ok(result)
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
