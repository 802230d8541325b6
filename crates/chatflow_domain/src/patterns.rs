use crate::RunConfig;
use regex::Regex;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RuleKind {
    IssueCreated,
    PullRequestCreated,
    PullRequestProcessed,
}

/// A completion marker the model is instructed to emit, and what happens next.
///
/// `prompt_template` understands two placeholders: `{repo}` (the one- or
/// two-segment repository path exactly as written) and `{number}`.
#[derive(Clone, Copy, Debug)]
pub struct WorkflowActionRule {
    pub kind: RuleKind,
    pub pattern: &'static str,
    pub prompt_template: &'static str,
    pub target_context_id: &'static str,
    pub model_id: &'static str,
    pub preset_id: &'static str,
    pub description: &'static str,
}

impl WorkflowActionRule {
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            model_id: self.model_id.to_owned(),
            preset_id: Some(self.preset_id.to_owned()),
            description: Some(self.description.to_owned()),
            target_context_id: Some(self.target_context_id.to_owned()),
        }
    }

    pub fn render_prompt(&self, captures: &RuleCaptures) -> String {
        self.prompt_template
            .replace("{repo}", &captures.repo)
            .replace("{number}", &captures.number)
    }
}

// Order matters: the first matching rule wins.
pub const WORKFLOW_RULES: &[WorkflowActionRule] = &[
    WorkflowActionRule {
        kind: RuleKind::IssueCreated,
        pattern: r"(?i)ik heb issue #?(?P<number>\d+) aangemaakt voor repo (?P<repo>[\w-]+(?:\.[\w-]+)*(?:/[\w-]+(?:\.[\w-]+)*)?)",
        prompt_template: "Ga naar Repo {repo} en pak issue {number} op",
        target_context_id: "issue",
        model_id: "claude-3-7-sonnet-20250219",
        preset_id: "developer",
        description: "Issue oppakken en implementeren",
    },
    WorkflowActionRule {
        kind: RuleKind::PullRequestCreated,
        pattern: r"(?i)ik heb pull request #?(?P<number>\d+) aangemaakt voor repo (?P<repo>[\w-]+(?:\.[\w-]+)*(?:/[\w-]+(?:\.[\w-]+)*)?)",
        prompt_template: "Ga naar Repo {repo} en merge Pull Request {number} en delete de bijbehorende branche",
        target_context_id: "pull-request",
        model_id: "claude-3-5-sonnet-20241022",
        preset_id: "reviewer",
        description: "Pull request reviewen en mergen",
    },
    WorkflowActionRule {
        kind: RuleKind::PullRequestProcessed,
        pattern: r"(?i)ik heb pull request #?(?P<number>\d+) verwerkt en (?:de )?bijbehorende branche (?:(?P<branch>\S+) )?verwijderd voor repo (?P<repo>[\w-]+(?:\.[\w-]+)*(?:/[\w-]+(?:\.[\w-]+)*)?)",
        prompt_template: "Ga Repo {repo}",
        target_context_id: "repository",
        model_id: "claude-3-5-haiku-20241022",
        preset_id: "project-manager",
        description: "Volgende issue in de repository kiezen",
    },
];

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuleCaptures {
    pub number: String,
    pub repo: String,
    /// Captured by the PR-processed rule; no template uses it.
    pub branch: Option<String>,
}

#[derive(Clone, Debug)]
pub struct WorkflowMatch {
    pub rule: WorkflowActionRule,
    pub captures: RuleCaptures,
    pub next_prompt: String,
}

/// Recognizes completion markers in assistant text.
pub trait PatternMatcher: Send + Sync {
    fn find(&self, text: &str) -> Option<WorkflowMatch>;
}

pub struct RegexPatternRegistry {
    rules: Vec<(WorkflowActionRule, Regex)>,
}

impl RegexPatternRegistry {
    pub fn with_rules(rules: &[WorkflowActionRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|rule| Regex::new(rule.pattern).map(|re| (*rule, re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn standard() -> Self {
        Self::with_rules(WORKFLOW_RULES).expect("built-in workflow patterns must compile")
    }
}

impl std::fmt::Debug for RegexPatternRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|(rule, _)| rule.kind))
            .finish()
    }
}

impl PatternMatcher for RegexPatternRegistry {
    fn find(&self, text: &str) -> Option<WorkflowMatch> {
        self.rules.iter().find_map(|(rule, re)| {
            let caps = re.captures(text)?;
            let captures = RuleCaptures {
                number: caps.name("number")?.as_str().to_owned(),
                repo: caps.name("repo")?.as_str().to_owned(),
                branch: caps.name("branch").map(|m| m.as_str().to_owned()),
            };
            Some(WorkflowMatch {
                rule: *rule,
                next_prompt: rule.render_prompt(&captures),
                captures,
            })
        })
    }
}
