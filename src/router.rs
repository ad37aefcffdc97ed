use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::platform::{Category, PlatformId};
use crate::state_machine::Job;
use crate::strategy::{
    ComplexFormStrategy, DirectApplyStrategy, FormStrategy, GenericStrategy, NativeFlowStrategy,
};

/// How a rule matches a parsed job URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlMatcher {
    /// Host equal to, or a subdomain of, `host_suffix`, optionally under a path prefix.
    HostPath {
        host_suffix: String,
        path_prefix: Option<String>,
    },
    /// Query string carries this key (embedded job boards).
    QueryKey(String),
    /// Case-insensitive substring anywhere in the URL.
    Substring(String),
}

impl UrlMatcher {
    pub fn host(host_suffix: &str) -> Self {
        UrlMatcher::HostPath {
            host_suffix: host_suffix.to_string(),
            path_prefix: None,
        }
    }

    pub fn host_path(host_suffix: &str, path_prefix: &str) -> Self {
        UrlMatcher::HostPath {
            host_suffix: host_suffix.to_string(),
            path_prefix: Some(path_prefix.to_string()),
        }
    }

    fn is_specific(&self) -> bool {
        !matches!(self, UrlMatcher::Substring(_))
    }

    fn matches(&self, url: &Url, lower: &str) -> bool {
        match self {
            UrlMatcher::HostPath {
                host_suffix,
                path_prefix,
            } => {
                let Some(host) = url.host_str() else {
                    return false;
                };
                let host = host.to_ascii_lowercase();
                let host_ok = host == *host_suffix || host.ends_with(&format!(".{host_suffix}"));
                host_ok
                    && path_prefix
                        .as_deref()
                        .is_none_or(|p| url.path().to_ascii_lowercase().starts_with(p))
            }
            UrlMatcher::QueryKey(key) => url.query_pairs().any(|(k, _)| k == key.as_str()),
            UrlMatcher::Substring(needle) => lower.contains(needle.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlRule {
    pub matcher: UrlMatcher,
    pub platform: PlatformId,
}

/// Everything the executor needs to run one platform.
#[derive(Clone)]
pub struct RouteEntry {
    pub platform: PlatformId,
    pub strategy: Arc<dyn FormStrategy>,
    pub category: Category,
    pub timeout: Duration,
    pub max_steps: u32,
}

/// Maps job URLs to platforms and platforms to strategies.
///
/// Classification is pure: URL rules (specific host/path/query rules before
/// substring rules, registration order within each group), then optional
/// page-content markers, then `Unknown`.
pub struct PlatformRouter {
    rules: Vec<UrlRule>,
    markers: Vec<(String, PlatformId)>,
    strategies: HashMap<PlatformId, Arc<dyn FormStrategy>>,
    fallback: Arc<dyn FormStrategy>,
}

impl Default for PlatformRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformRouter {
    pub fn new() -> Self {
        let rules = vec![
            (UrlMatcher::host("boards.greenhouse.io"), PlatformId::Greenhouse),
            (UrlMatcher::host("job-boards.greenhouse.io"), PlatformId::Greenhouse),
            (UrlMatcher::QueryKey("gh_jid".into()), PlatformId::Greenhouse),
            (UrlMatcher::host("jobs.lever.co"), PlatformId::Lever),
            (UrlMatcher::host("jobs.ashbyhq.com"), PlatformId::Ashby),
            (UrlMatcher::host_path("linkedin.com", "/jobs"), PlatformId::LinkedIn),
            (UrlMatcher::host("indeed.com"), PlatformId::Indeed),
            (UrlMatcher::host("myworkdayjobs.com"), PlatformId::Workday),
            (UrlMatcher::host("myworkdaysite.com"), PlatformId::Workday),
            (UrlMatcher::host("taleo.net"), PlatformId::Taleo),
            (UrlMatcher::Substring("greenhouse".into()), PlatformId::Greenhouse),
            (UrlMatcher::Substring("lever.co".into()), PlatformId::Lever),
            (UrlMatcher::Substring("ashbyhq".into()), PlatformId::Ashby),
            (UrlMatcher::Substring("workday".into()), PlatformId::Workday),
            (UrlMatcher::Substring("taleo".into()), PlatformId::Taleo),
        ]
        .into_iter()
        .map(|(matcher, platform)| UrlRule { matcher, platform })
        .collect();

        let markers = [
            ("grnhse_app", PlatformId::Greenhouse),
            ("boards.greenhouse.io", PlatformId::Greenhouse),
            ("lever-application", PlatformId::Lever),
            ("jobs.lever.co", PlatformId::Lever),
            ("ashby_embed", PlatformId::Ashby),
            ("jobs.ashbyhq.com", PlatformId::Ashby),
            ("data-automation-id", PlatformId::Workday),
            ("taleo", PlatformId::Taleo),
        ]
        .into_iter()
        .map(|(m, p)| (m.to_string(), p))
        .collect();

        let mut strategies: HashMap<PlatformId, Arc<dyn FormStrategy>> = HashMap::new();
        for platform in PlatformId::ALL {
            let strategy: Option<Arc<dyn FormStrategy>> = match platform.category() {
                Category::DirectApply => DirectApplyStrategy::for_platform(platform)
                    .map(|s| Arc::new(s) as Arc<dyn FormStrategy>),
                Category::NativeFlow => NativeFlowStrategy::for_platform(platform)
                    .map(|s| Arc::new(s) as Arc<dyn FormStrategy>),
                Category::ComplexMultiStep => ComplexFormStrategy::for_platform(platform)
                    .map(|s| Arc::new(s) as Arc<dyn FormStrategy>),
            };
            if let Some(strategy) = strategy {
                strategies.insert(platform, strategy);
            }
        }

        Self {
            rules,
            markers,
            strategies,
            fallback: Arc::new(GenericStrategy::new()),
        }
    }

    /// Append a URL rule. Specific rules still win over substring rules.
    pub fn with_rule(mut self, matcher: UrlMatcher, platform: PlatformId) -> Self {
        self.rules.push(UrlRule { matcher, platform });
        self
    }

    /// Replace the strategy for one platform. `Unknown` replaces the fallback.
    pub fn with_strategy(mut self, platform: PlatformId, strategy: Arc<dyn FormStrategy>) -> Self {
        if platform == PlatformId::Unknown {
            self.fallback = strategy;
        } else {
            self.strategies.insert(platform, strategy);
        }
        self
    }

    /// Use one strategy for every platform.
    pub fn with_strategy_for_all(mut self, strategy: Arc<dyn FormStrategy>) -> Self {
        for platform in PlatformId::ALL {
            self = self.with_strategy(platform, Arc::clone(&strategy));
        }
        self
    }

    pub fn classify(&self, url: &str) -> PlatformId {
        self.classify_with_content(url, None)
    }

    pub fn classify_with_content(&self, url: &str, content: Option<&str>) -> PlatformId {
        let Ok(parsed) = Url::parse(url.trim()) else {
            return PlatformId::Unknown;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return PlatformId::Unknown;
        }
        let lower = url.to_lowercase();

        let by_url = self
            .rules
            .iter()
            .filter(|r| r.matcher.is_specific())
            .chain(self.rules.iter().filter(|r| !r.matcher.is_specific()))
            .find(|r| r.matcher.matches(&parsed, &lower))
            .map(|r| r.platform);
        if let Some(platform) = by_url {
            return platform;
        }

        if let Some(content) = content {
            let content = content.to_lowercase();
            if let Some((_, platform)) = self.markers.iter().find(|(m, _)| content.contains(m.as_str())) {
                return *platform;
            }
        }
        PlatformId::Unknown
    }

    /// Resolve a job to exactly one platform. The URL wins; the job's hint is
    /// used only when the URL says nothing.
    pub fn resolve_job(&self, job: &Job) -> PlatformId {
        match self.classify(&job.url) {
            PlatformId::Unknown => job.platform_hint.unwrap_or(PlatformId::Unknown),
            known => known,
        }
    }

    pub fn resolve_strategy(&self, platform: PlatformId) -> RouteEntry {
        let strategy = self
            .strategies
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback));
        let category = platform.category();
        RouteEntry {
            platform,
            strategy,
            category,
            timeout: category.timeout_budget(),
            max_steps: platform.max_steps(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Plan, ScriptedStrategy};

    #[test]
    fn classifies_known_hosts() {
        let r = PlatformRouter::new();
        assert_eq!(r.classify("https://boards.greenhouse.io/acme/jobs/123"), PlatformId::Greenhouse);
        assert_eq!(r.classify("https://job-boards.greenhouse.io/acme/jobs/9"), PlatformId::Greenhouse);
        assert_eq!(r.classify("https://jobs.lever.co/acme/abc-def"), PlatformId::Lever);
        assert_eq!(r.classify("https://jobs.ashbyhq.com/acme/1"), PlatformId::Ashby);
        assert_eq!(r.classify("https://www.linkedin.com/jobs/view/1234"), PlatformId::LinkedIn);
        assert_eq!(r.classify("https://www.indeed.com/viewjob?jk=1"), PlatformId::Indeed);
        assert_eq!(
            r.classify("https://acme.wd5.myworkdayjobs.com/en-US/External/job/X"),
            PlatformId::Workday
        );
        assert_eq!(r.classify("https://acme.taleo.net/careersection/2/jobdetail.ftl"), PlatformId::Taleo);
    }

    #[test]
    fn embedded_greenhouse_by_query_key() {
        let r = PlatformRouter::new();
        assert_eq!(r.classify("https://acme.com/careers?gh_jid=4412"), PlatformId::Greenhouse);
    }

    #[test]
    fn linkedin_outside_jobs_is_unknown() {
        let r = PlatformRouter::new();
        assert_eq!(r.classify("https://www.linkedin.com/in/someone"), PlatformId::Unknown);
    }

    #[test]
    fn host_suffix_requires_label_boundary() {
        let r = PlatformRouter::new();
        assert_eq!(r.classify("https://notindeed.com/job/1"), PlatformId::Unknown);
    }

    #[test]
    fn specific_rules_beat_substrings() {
        // A Lever posting whose slug mentions workday.
        let r = PlatformRouter::new();
        assert_eq!(r.classify("https://jobs.lever.co/acme/workday-integrations-engineer"), PlatformId::Lever);
    }

    #[test]
    fn ties_go_to_the_first_registered_rule() {
        let r = PlatformRouter::new();
        assert_eq!(
            r.classify("https://careers.acme.com/greenhouse-to-workday/1"),
            PlatformId::Greenhouse
        );
        assert_eq!(
            r.classify("https://careers.acme.com/workday-and-taleo/1"),
            PlatformId::Workday
        );

        let r = PlatformRouter::new()
            .with_rule(UrlMatcher::host("careers.acme.com"), PlatformId::Ashby)
            .with_rule(UrlMatcher::host_path("careers.acme.com", "/jobs"), PlatformId::Taleo);
        assert_eq!(r.classify("https://careers.acme.com/jobs/taleo/1"), PlatformId::Ashby);
    }

    #[test]
    fn substring_fallback() {
        let r = PlatformRouter::new();
        assert_eq!(r.classify("https://careers.acme.com/workday/job/1"), PlatformId::Workday);
    }

    #[test]
    fn malformed_urls_are_unknown() {
        let r = PlatformRouter::new();
        assert_eq!(r.classify("not a url"), PlatformId::Unknown);
        assert_eq!(r.classify(""), PlatformId::Unknown);
        assert_eq!(r.classify("mailto:jobs@greenhouse.io"), PlatformId::Unknown);
    }

    #[test]
    fn classification_is_deterministic() {
        let r = PlatformRouter::new();
        let urls = [
            "https://boards.greenhouse.io/a/jobs/1",
            "https://example.org/x",
            "https://jobs.lever.co/b/2",
        ];
        for url in urls {
            let first = r.classify(url);
            for _ in 0..10 {
                assert_eq!(r.classify(url), first);
            }
        }
    }

    #[test]
    fn content_markers_when_url_is_silent() {
        let r = PlatformRouter::new();
        let url = "https://careers.acme.com/openings/42";
        assert_eq!(r.classify(url), PlatformId::Unknown);
        assert_eq!(
            r.classify_with_content(url, Some(r#"<div id="grnhse_app"></div>"#)),
            PlatformId::Greenhouse
        );
        assert_eq!(
            r.classify_with_content(url, Some(r#"<input data-automation-id="email">"#)),
            PlatformId::Workday
        );
        assert_eq!(r.classify_with_content(url, Some("<p>hello</p>")), PlatformId::Unknown);
    }

    #[test]
    fn custom_rules_can_be_added() {
        let r = PlatformRouter::new().with_rule(UrlMatcher::host("apply.acme.com"), PlatformId::Lever);
        assert_eq!(r.classify("https://apply.acme.com/123"), PlatformId::Lever);
    }

    #[test]
    fn hint_used_only_for_unknown_urls() {
        let r = PlatformRouter::new();
        let mut job = Job::new("https://careers.acme.com/1");
        job.platform_hint = Some(PlatformId::Ashby);
        assert_eq!(r.resolve_job(&job), PlatformId::Ashby);

        let mut job = Job::new("https://jobs.lever.co/acme/1");
        job.platform_hint = Some(PlatformId::Ashby);
        assert_eq!(r.resolve_job(&job), PlatformId::Lever);
    }

    #[test]
    fn every_platform_resolves() {
        let r = PlatformRouter::new();
        for p in PlatformId::ALL {
            let entry = r.resolve_strategy(p);
            assert_eq!(entry.category, p.category());
            assert_eq!(entry.max_steps, p.max_steps());
        }
        assert_eq!(r.resolve_strategy(PlatformId::Greenhouse).strategy.name(), "direct_apply");
        assert_eq!(r.resolve_strategy(PlatformId::LinkedIn).strategy.name(), "native_flow");
        assert_eq!(r.resolve_strategy(PlatformId::Taleo).strategy.name(), "complex_form");
        assert_eq!(r.resolve_strategy(PlatformId::Unknown).strategy.name(), "generic");
        assert_eq!(
            r.resolve_strategy(PlatformId::Unknown).timeout,
            Category::ComplexMultiStep.timeout_budget()
        );
    }

    #[test]
    fn strategies_can_be_overridden() {
        let r = PlatformRouter::new()
            .with_strategy(PlatformId::Lever, Arc::new(ScriptedStrategy::new(Plan::Confirmed)));
        assert_eq!(r.resolve_strategy(PlatformId::Lever).strategy.name(), "scripted");
        assert_eq!(r.resolve_strategy(PlatformId::Greenhouse).strategy.name(), "direct_apply");
    }
}
