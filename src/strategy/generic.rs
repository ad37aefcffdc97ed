//! Best-effort strategy for platforms the router cannot place.

use async_trait::async_trait;

use super::{
    FillResult, FormLayout, FormStrategy, NavigationResult, ProfileField, StepResult,
    StrategyError, SubmitResult, SuccessMarkers, advance_with, detect_success, fill_profile,
    reach_form, screen_landing, submit_with,
};
use crate::provider::{BrowserPage, SelectorChain};
use crate::state_machine::{CandidateProfile, Confirmation, Job};

pub struct GenericStrategy {
    layout: FormLayout,
}

impl Default for GenericStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericStrategy {
    pub fn new() -> Self {
        Self { layout: layout() }
    }
}

fn chain(selectors: &[&str]) -> SelectorChain {
    SelectorChain::new(selectors)
}

fn layout() -> FormLayout {
    FormLayout {
        apply_button: chain(&[
            r#"a[href*="apply"]"#,
            r#"button[data-testid*="apply"]"#,
            ".apply-button",
            "#apply",
        ]),
        fields: vec![
            (
                ProfileField::FirstName,
                chain(&[
                    r#"input[name="first_name"]"#,
                    r#"input[name="firstName"]"#,
                    r#"input[name="firstname"]"#,
                    r#"input[id="first_name"]"#,
                    r#"input[placeholder*="first name" i]"#,
                    r#"input[aria-label*="first name" i]"#,
                ]),
            ),
            (
                ProfileField::LastName,
                chain(&[
                    r#"input[name="last_name"]"#,
                    r#"input[name="lastName"]"#,
                    r#"input[name="lastname"]"#,
                    r#"input[id="last_name"]"#,
                    r#"input[placeholder*="last name" i]"#,
                    r#"input[aria-label*="last name" i]"#,
                ]),
            ),
            (
                ProfileField::Email,
                chain(&[
                    r#"input[type="email"]"#,
                    r#"input[name="email"]"#,
                    r#"input[name="email_address"]"#,
                    r#"input[placeholder*="email" i]"#,
                ]),
            ),
            (
                ProfileField::Phone,
                chain(&[
                    r#"input[type="tel"]"#,
                    r#"input[name="phone"]"#,
                    r#"input[name="phone_number"]"#,
                    r#"input[placeholder*="phone" i]"#,
                ]),
            ),
            (
                ProfileField::LinkedIn,
                chain(&[
                    r#"input[name="linkedin"]"#,
                    r#"input[name="linkedin_url"]"#,
                    r#"input[placeholder*="linkedin" i]"#,
                ]),
            ),
            (
                ProfileField::Website,
                chain(&[
                    r#"input[name="website"]"#,
                    r#"input[name="portfolio"]"#,
                    r#"input[placeholder*="website" i]"#,
                ]),
            ),
        ],
        resume: chain(&[
            r#"input[type="file"][name*="resume"]"#,
            r#"input[type="file"][name*="cv"]"#,
            r#"input[type="file"][accept*=".pdf"]"#,
            r#"input[type="file"]"#,
        ]),
        next: chain(&[r#"button[data-action="next"]"#, r#"button[aria-label*="next" i]"#]),
        review: SelectorChain::default(),
        submit: chain(&[
            r#"button[type="submit"]"#,
            r#"input[type="submit"]"#,
            r#"button[data-action="submit"]"#,
            r#"button[data-testid*="submit"]"#,
        ]),
        validation_errors: chain(&[".form-error", ".has-error"]),
        already_applied: &["you have already applied", "already submitted"],
        closed: &["no longer accepting applications", "position has been filled", "job has expired"],
        success: SuccessMarkers {
            selectors: chain(&[
                ".success-message",
                ".thank-you",
                ".confirmation",
                ".alert-success",
                ".notification-success",
            ]),
            phrases: &[
                "thank you for applying",
                "application received",
                "application has been submitted",
                "successfully submitted",
            ],
            url_tokens: &["thank", "success", "confirmation", "submitted"],
        },
    }
}

#[async_trait]
impl FormStrategy for GenericStrategy {
    fn name(&self) -> &'static str {
        "generic"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::OpenQuestion;
    use crate::testing::{FakePage, profile};

    #[tokio::test]
    async fn fills_with_loose_selectors_and_reports_questions() {
        let s = GenericStrategy::new();
        let page = FakePage::new("g")
            .with_elements(&[
                r#"input[name="firstName"]"#,
                r#"input[name="lastName"]"#,
                r#"input[type="email"]"#,
                r#"button[type="submit"]"#,
            ])
            .with_questions(vec![OpenQuestion {
                label: "Why us?".into(),
                selector: "#q1".into(),
                required: true,
            }]);
        let job = Job::new("https://careers.example.org/jobs/7");
        assert_eq!(s.navigate(&page, &job).await.unwrap(), NavigationResult::FormReached);

        let result = s.fill_fields(&page, &profile()).await.unwrap();
        assert!(result.missing_required.is_empty());
        assert_eq!(result.open_questions.len(), 1);
        assert_eq!(s.advance(&page).await.unwrap(), StepResult::Complete);
    }

    #[tokio::test]
    async fn fill_answer_requires_the_control() {
        let s = GenericStrategy::new();
        let question = OpenQuestion {
            label: "Why us?".into(),
            selector: "#q1".into(),
            required: true,
        };
        let page = FakePage::new("g").with_elements(&["#q1"]);
        s.fill_answer(&page, &question, "Because.").await.unwrap();
        assert_eq!(page.value_of("#q1").as_deref(), Some("Because."));

        let gone = FakePage::new("g2");
        assert!(matches!(
            s.fill_answer(&gone, &question, "Because.").await,
            Err(StrategyError::Structural(_))
        ));
    }

    #[tokio::test]
    async fn page_without_controls_terminates() {
        let page = FakePage::new("g");
        assert!(matches!(
            GenericStrategy::new().advance(&page).await.unwrap(),
            StepResult::Terminated(_)
        ));
    }
}
