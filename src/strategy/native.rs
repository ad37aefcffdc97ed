//! In-platform "easy apply" flows (LinkedIn, Indeed): a modal opened from the
//! job page, stepped through with Next / Review buttons.

use async_trait::async_trait;

use super::{
    FillResult, FormLayout, FormStrategy, NavigationResult, ProfileField, StepResult,
    StrategyError, SubmitResult, SuccessMarkers, advance_with, click_chain, detect_success,
    fill_profile, form_visible, has_challenge, is_present, screen_landing, submit_with,
};
use crate::platform::PlatformId;
use crate::provider::{BrowserPage, SelectorChain};
use crate::state_machine::{CandidateProfile, Confirmation, Job};

pub struct NativeFlowStrategy {
    platform: PlatformId,
    layout: FormLayout,
    /// Apply button that leaves the platform for the employer's own ATS.
    external_apply: SelectorChain,
}

impl NativeFlowStrategy {
    pub fn for_platform(platform: PlatformId) -> Option<Self> {
        let (layout, external_apply) = match platform {
            PlatformId::LinkedIn => linkedin(),
            PlatformId::Indeed => indeed(),
            _ => return None,
        };
        Some(Self {
            platform,
            layout,
            external_apply,
        })
    }

    pub fn platform(&self) -> PlatformId {
        self.platform
    }
}

fn chain(group: &str) -> SelectorChain {
    SelectorChain::parse(group)
}

fn linkedin() -> (FormLayout, SelectorChain) {
    let layout = FormLayout {
        apply_button: chain(
            r#"button.jobs-apply-button, [data-test-easy-apply-button], button[data-control-name="jobdetails_topcard_inapply"], .jobs-apply-button--top-card"#,
        ),
        fields: vec![
            (ProfileField::FirstName, chain(r#"input[id*="firstName"]"#)),
            (ProfileField::LastName, chain(r#"input[id*="lastName"]"#)),
            (
                ProfileField::Email,
                chain(r#"select[id*="emailAddress"], input[id*="email"]"#),
            ),
            (
                ProfileField::Phone,
                chain(r#"input[id*="phoneNumber-nationalNumber"], input[id*="phoneNumber"]"#),
            ),
            (ProfileField::Location, chain(r#"input[id*="location-GEO-LOCATION"]"#)),
        ],
        resume: chain(r#"input[type="file"][name="file"], input[type="file"]"#),
        next: chain(r#"button[aria-label="Continue to next step"]"#),
        review: chain(r#"button[aria-label="Review your application"]"#),
        submit: chain(r#"button[aria-label="Submit application"]"#),
        validation_errors: chain(".artdeco-inline-feedback--error"),
        already_applied: &["you applied", "application submitted on"],
        closed: &["no longer accepting applications"],
        success: SuccessMarkers {
            selectors: chain(".artdeco-inline-feedback--success, .jpac-modal-header"),
            phrases: &["application sent", "your application was sent"],
            url_tokens: &["post-apply"],
        },
    };
    let external = chain(r#"button[aria-label*="on company website"], .jobs-apply-button--offsite"#);
    (layout, external)
}

fn indeed() -> (FormLayout, SelectorChain) {
    let layout = FormLayout {
        apply_button: chain(
            r#"button[data-testid="apply-button"], button[data-indeed-apply], #indeedApplyButton"#,
        ),
        fields: vec![
            (
                ProfileField::FirstName,
                chain(r#"input[name="firstName"], input[id*="firstName"], input[autocomplete="given-name"]"#),
            ),
            (
                ProfileField::LastName,
                chain(r#"input[name="lastName"], input[id*="lastName"], input[autocomplete="family-name"]"#),
            ),
            (
                ProfileField::Email,
                chain(r#"input[type="email"], input[name="email"], input[autocomplete="email"]"#),
            ),
            (
                ProfileField::Phone,
                chain(r#"input[type="tel"], input[name="phone"], input[autocomplete="tel"]"#),
            ),
        ],
        resume: chain(r#"input[type="file"][name="resume"], input[type="file"][accept*=".pdf"]"#),
        next: chain(r#"button[data-testid="continue-button"], .ia-continueButton"#),
        review: chain(r#"button[data-testid="review-button"]"#),
        submit: chain(r#"button[data-testid="submit-application-button"]"#),
        validation_errors: chain(r#"[data-testid="error-message"], .ia-ErrorText"#),
        already_applied: &["you applied", "applied on indeed"],
        closed: &["this job has expired", "no longer accepting applications"],
        success: SuccessMarkers {
            selectors: chain(r#"[data-testid="application-submitted"]"#),
            phrases: &["your application has been submitted", "application submitted"],
            url_tokens: &["post-apply", "confirmation"],
        },
    };
    let external = chain(r#"button[data-testid="apply-external-button"], button[aria-label*="company site"]"#);
    (layout, external)
}

#[async_trait]
impl FormStrategy for NativeFlowStrategy {
    fn name(&self) -> &'static str {
        "native_flow"
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
        if !click_chain(page, &self.layout.apply_button).await? {
            if is_present(page, &self.external_apply).await? {
                return Ok(NavigationResult::NoApplicationPath(
                    "external apply only".into(),
                ));
            }
            return Ok(NavigationResult::NoApplicationPath(
                "no easy apply button".into(),
            ));
        }
        if has_challenge(page).await? {
            return Ok(NavigationResult::Challenge("captcha in apply modal".into()));
        }
        // Some modals open on a page without profile fields (e.g. résumé only).
        if form_visible(page, &self.layout).await?
            || is_present(page, &self.layout.next).await?
            || is_present(page, &self.layout.review).await?
            || is_present(page, &self.layout.submit).await?
        {
            Ok(NavigationResult::FormReached)
        } else {
            Ok(NavigationResult::NoApplicationPath(
                "apply modal did not open".into(),
            ))
        }
    }

    async fn fill_fields(
        &self,
        page: &dyn BrowserPage,
        profile: &CandidateProfile,
    ) -> Result<FillResult, StrategyError> {
        let mut result = fill_profile(page, &self.layout, profile).await?;
        // Later modal pages carry no contact fields; only the first page
        // is expected to have them.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePage, PageChange, profile};

    const NEXT: &str = r#"button[aria-label="Continue to next step"]"#;
    const REVIEW: &str = r#"button[aria-label="Review your application"]"#;
    const SUBMIT: &str = r#"button[aria-label="Submit application"]"#;

    fn strategy() -> NativeFlowStrategy {
        NativeFlowStrategy::for_platform(PlatformId::LinkedIn).unwrap()
    }

    #[tokio::test]
    async fn easy_apply_walks_pages_to_submit() {
        let s = strategy();
        let page = FakePage::new("li")
            .with_elements(&["button.jobs-apply-button"])
            .on_click(
                "button.jobs-apply-button",
                vec![
                    PageChange::Show(r#"input[id*="firstName"]"#.into()),
                    PageChange::Show(NEXT.into()),
                ],
            )
            .on_click(
                NEXT,
                vec![PageChange::Hide(NEXT.into()), PageChange::Show(REVIEW.into())],
            )
            .on_click(
                REVIEW,
                vec![PageChange::Hide(REVIEW.into()), PageChange::Show(SUBMIT.into())],
            )
            .on_click(SUBMIT, vec![PageChange::Text("Your application was sent to Acme".into())]);
        let job = Job::new("https://www.linkedin.com/jobs/view/42");

        assert_eq!(s.navigate(&page, &job).await.unwrap(), NavigationResult::FormReached);
        s.fill_fields(&page, &profile()).await.unwrap();
        assert_eq!(s.advance(&page).await.unwrap(), StepResult::Advanced);
        assert_eq!(s.advance(&page).await.unwrap(), StepResult::Review);
        assert_eq!(s.advance(&page).await.unwrap(), StepResult::Complete);
        let before = page.current_url().await.unwrap();
        assert_eq!(s.submit(&page, true).await.unwrap(), SubmitResult::Clicked);
        let conf = s.verify_success(&page, &before).await.unwrap().unwrap();
        assert_eq!(conf.indicator, "text: your application was sent");
    }

    #[tokio::test]
    async fn external_apply_has_no_path() {
        let s = strategy();
        let page = FakePage::new("li").with_elements(&[".jobs-apply-button--offsite"]);
        let job = Job::new("https://www.linkedin.com/jobs/view/43");
        assert_eq!(
            s.navigate(&page, &job).await.unwrap(),
            NavigationResult::NoApplicationPath("external apply only".into())
        );
    }

    #[tokio::test]
    async fn captcha_mid_flow_is_anti_bot() {
        let s = strategy();
        let page = FakePage::new("li").with_elements(&[NEXT, ".challenge-dialog"]);
        let err = s.advance(&page).await.unwrap_err();
        assert!(matches!(err, StrategyError::AntiBot(_)));
    }

    #[tokio::test]
    async fn validation_errors_stop_the_flow() {
        let s = strategy();
        let page = FakePage::new("li").with_elements(&[NEXT, ".artdeco-inline-feedback--error"]);
        assert!(matches!(
            s.advance(&page).await.unwrap(),
            StepResult::Terminated(_)
        ));
        assert!(page.clicks().is_empty());
    }

    #[tokio::test]
    async fn indeed_already_applied() {
        let s = NativeFlowStrategy::for_platform(PlatformId::Indeed).unwrap();
        let page = FakePage::new("in").with_text("You applied 3 days ago");
        let job = Job::new("https://www.indeed.com/viewjob?jk=abc");
        assert_eq!(s.navigate(&page, &job).await.unwrap(), NavigationResult::AlreadyApplied);
    }
}
