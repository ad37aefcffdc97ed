//! In-crate fakes shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::platform::PlatformId;
use crate::provider::{
    Action, BrowserPage, ElementHandle, ExtractSchema, ProviderError, SelectorChain,
    SessionOptions, SessionProvider,
};
use crate::state_machine::{AnswerCategory, CandidateProfile, Confirmation, Job, ResumeRef};
use crate::strategy::{
    FillResult, FormStrategy, NavigationResult, OpenQuestion, StepResult, StrategyError,
    SubmitResult,
};

pub fn profile() -> CandidateProfile {
    let mut answers = HashMap::new();
    answers.insert(AnswerCategory::WorkAuthorization, "Yes".to_string());
    CandidateProfile {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        email: "ada@example.com".into(),
        phone: "555-0100".into(),
        location: "London".into(),
        linkedin_url: None,
        website: None,
        resume: ResumeRef(PathBuf::from("cv.pdf")),
        answers,
    }
}

/// Effect of clicking an element on a [`FakePage`].
#[derive(Debug, Clone)]
pub enum PageChange {
    Text(String),
    Url(String),
    Show(String),
    Hide(String),
}

#[derive(Debug, Clone, Copy)]
pub enum FailKind {
    Timeout,
    Detached,
}

struct PageState {
    url: String,
    text: String,
    present: HashSet<String>,
    questions: Vec<OpenQuestion>,
    values: HashMap<String, String>,
    clicks: Vec<String>,
    navigations: Vec<String>,
    on_click: HashMap<String, Vec<PageChange>>,
    nav_failures: VecDeque<FailKind>,
}

/// Scripted page: a set of present selectors, page text, URL and click effects.
pub struct FakePage {
    id: String,
    state: Mutex<PageState>,
}

impl FakePage {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(PageState {
                url: "about:blank".into(),
                text: String::new(),
                present: HashSet::new(),
                questions: Vec::new(),
                values: HashMap::new(),
                clicks: Vec::new(),
                navigations: Vec::new(),
                on_click: HashMap::new(),
                nav_failures: VecDeque::new(),
            }),
        }
    }

    pub fn with_text(self, text: &str) -> Self {
        self.state.lock().text = text.to_string();
        self
    }

    pub fn with_url(self, url: &str) -> Self {
        self.state.lock().url = url.to_string();
        self
    }

    pub fn with_elements(self, selectors: &[&str]) -> Self {
        self.state
            .lock()
            .present
            .extend(selectors.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_questions(self, questions: Vec<OpenQuestion>) -> Self {
        self.state.lock().questions = questions;
        self
    }

    pub fn on_click(self, selector: &str, changes: Vec<PageChange>) -> Self {
        self.state
            .lock()
            .on_click
            .insert(selector.to_string(), changes);
        self
    }

    pub fn fail_navigation(self, kinds: &[FailKind]) -> Self {
        self.state.lock().nav_failures.extend(kinds.iter().copied());
        self
    }

    pub fn value_of(&self, selector: &str) -> Option<String> {
        self.state.lock().values.get(selector).cloned()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().clicks.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().navigations.clone()
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        match state.nav_failures.pop_front() {
            Some(FailKind::Timeout) => Err(ProviderError::Timeout(format!("navigate {url}"))),
            Some(FailKind::Detached) => Err(ProviderError::Detached(self.id.clone())),
            None => {
                state.navigations.push(url.to_string());
                state.url = url.to_string();
                Ok(())
            }
        }
    }

    async fn current_url(&self) -> Result<String, ProviderError> {
        Ok(self.state.lock().url.clone())
    }

    async fn locate(&self, chain: &SelectorChain) -> Result<Option<ElementHandle>, ProviderError> {
        let state = self.state.lock();
        Ok(chain
            .iter()
            .find(|s| state.present.contains(*s))
            .map(|s| ElementHandle {
                id: s.to_string(),
                selector: s.to_string(),
            }))
    }

    async fn act(
        &self,
        element: &ElementHandle,
        action: Action,
        value: Option<&str>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        match action {
            Action::Click => {
                state.clicks.push(element.selector.clone());
                let changes = state.on_click.get(&element.selector).cloned().unwrap_or_default();
                for change in changes {
                    match change {
                        PageChange::Text(t) => state.text = t,
                        PageChange::Url(u) => state.url = u,
                        PageChange::Show(s) => {
                            state.present.insert(s);
                        }
                        PageChange::Hide(s) => {
                            state.present.remove(&s);
                        }
                    }
                }
            }
            _ => {
                state
                    .values
                    .insert(element.selector.clone(), value.unwrap_or_default().to_string());
            }
        }
        Ok(())
    }

    async fn extract(&self, schema: &ExtractSchema) -> Result<serde_json::Value, ProviderError> {
        let state = self.state.lock();
        match schema {
            ExtractSchema::PageText => Ok(serde_json::Value::String(state.text.clone())),
            ExtractSchema::OpenQuestions => serde_json::to_value(&state.questions)
                .map_err(|e| ProviderError::Protocol(e.to_string())),
            ExtractSchema::Custom { .. } => Ok(serde_json::Value::Null),
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ProviderError> {
        Ok(b"\x89PNG fake".to_vec())
    }
}

/// Provider handing out [`FakePage`]s, counting creations and closes.
pub struct FakeProvider {
    name: String,
    max: usize,
    healthy: AtomicBool,
    fail_create: AtomicBool,
    created: AtomicUsize,
    closed: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(name: &str, max: usize) -> Self {
        Self {
            name: name.to_string(),
            max,
            healthy: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            closed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_sessions(&self) -> usize {
        self.max
    }

    async fn create_session(
        &self,
        _platform: PlatformId,
        _options: &SessionOptions,
    ) -> Result<Arc<dyn BrowserPage>, ProviderError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::Protocol("create refused".into()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(FakePage::new(&format!("{}-{n}", self.name))))
    }

    async fn close_session(&self, id: &str) -> Result<(), ProviderError> {
        self.closed.lock().push(id.to_string());
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// What a [`ScriptedStrategy`] does for one attempt.
#[derive(Debug, Clone)]
pub enum Plan {
    Confirmed,
    Unconfirmed,
    AlreadyApplied,
    Closed,
    NoPath,
    Challenge,
    NavigateTimeout,
    FillTimeout,
    /// `advance` never completes.
    Endless,
    /// One open question on the form.
    Question { required: bool },
    /// Confirmed, after sleeping in `navigate`.
    Slow(Duration),
    /// Submit is clicked, then the page is lost while verifying.
    SubmitThenFail,
    /// The form has no submit button.
    NoSubmitButton,
}

/// Strategy that ignores the page and follows per-URL plans, one plan per
/// attempt, falling back to a default.
pub struct ScriptedStrategy {
    default: Plan,
    plans: Mutex<HashMap<String, VecDeque<Plan>>>,
    active: Mutex<HashMap<String, Plan>>,
    navigations: AtomicUsize,
    submits: AtomicUsize,
}

impl ScriptedStrategy {
    pub fn new(default: Plan) -> Self {
        Self {
            default,
            plans: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            navigations: AtomicUsize::new(0),
            submits: AtomicUsize::new(0),
        }
    }

    pub fn script(self, url: &str, plans: Vec<Plan>) -> Self {
        self.plans.lock().insert(url.to_string(), plans.into());
        self
    }

    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    fn plan_for(&self, page: &dyn BrowserPage) -> Plan {
        self.active
            .lock()
            .get(page.id())
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl FormStrategy for ScriptedStrategy {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn navigate(
        &self,
        page: &dyn BrowserPage,
        job: &Job,
    ) -> Result<NavigationResult, StrategyError> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .get_mut(&job.url)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| self.default.clone());
        self.active.lock().insert(page.id().to_string(), plan.clone());
        match plan {
            Plan::Slow(d) => {
                tokio::time::sleep(d).await;
                Ok(NavigationResult::FormReached)
            }
            Plan::NavigateTimeout => Err(StrategyError::Transient("navigation timed out".into())),
            Plan::AlreadyApplied => Ok(NavigationResult::AlreadyApplied),
            Plan::Closed => Ok(NavigationResult::PositionClosed("posting closed".into())),
            Plan::NoPath => Ok(NavigationResult::NoApplicationPath("no form".into())),
            Plan::Challenge => Ok(NavigationResult::Challenge("captcha".into())),
            _ => Ok(NavigationResult::FormReached),
        }
    }

    async fn fill_fields(
        &self,
        page: &dyn BrowserPage,
        _profile: &CandidateProfile,
    ) -> Result<FillResult, StrategyError> {
        let filled = vec!["first_name".into(), "last_name".into(), "email".into()];
        match self.plan_for(page) {
            Plan::FillTimeout => Err(StrategyError::Transient("element wait timed out".into())),
            Plan::Question { required } => Ok(FillResult {
                filled,
                missing_required: Vec::new(),
                open_questions: vec![OpenQuestion {
                    label: "Are you legally authorized to work in the US?".into(),
                    selector: "#q_auth".into(),
                    required,
                }],
            }),
            _ => Ok(FillResult {
                filled,
                ..FillResult::default()
            }),
        }
    }

    async fn fill_answer(
        &self,
        _page: &dyn BrowserPage,
        _question: &OpenQuestion,
        _answer: &str,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    async fn advance(&self, page: &dyn BrowserPage) -> Result<StepResult, StrategyError> {
        match self.plan_for(page) {
            Plan::Endless => Ok(StepResult::Advanced),
            _ => Ok(StepResult::Complete),
        }
    }

    async fn submit(
        &self,
        page: &dyn BrowserPage,
        authorized: bool,
    ) -> Result<SubmitResult, StrategyError> {
        if matches!(self.plan_for(page), Plan::NoSubmitButton) {
            return Ok(SubmitResult::NoSubmitControl);
        }
        if !authorized {
            return Ok(SubmitResult::HeldForReview);
        }
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(SubmitResult::Clicked)
    }

    async fn verify_success(
        &self,
        page: &dyn BrowserPage,
        _submitted_from: &str,
    ) -> Result<Option<Confirmation>, StrategyError> {
        match self.plan_for(page) {
            Plan::Unconfirmed => Ok(None),
            Plan::SubmitThenFail => Err(StrategyError::Transient("page detached after submit".into())),
            _ => Ok(Some(Confirmation {
                indicator: "text: thank you".into(),
                confirmation_id: Some("CONF-1".into()),
            })),
        }
    }
}
