//! Pattern extraction from git history.
//!
//! Walks revisions newest-first with libgit2 and turns each eligible
//! revision into one [`Pattern`] that aggregates every path it touched.
//! The primary path becomes [`Pattern::file_path`]; the rest go into
//! [`PatternExtras::related_paths`].
//!
//! Skipped entirely (no pattern):
//! - merge revisions (more than one parent)
//! - automated revisions: bot authors, release/merge boilerplate messages,
//!   or diffs that only touch generated artifacts such as lockfiles
//! - revisions with an empty diff
//!
//! Extraction never writes. [`PatternExtractor::extract`] returns a lazy
//! iterator; dropping it early costs nothing, and calling `extract` again
//! starts over from HEAD.

use chrono::NaiveDate;
use git2::{Commit, DiffFormat, DiffOptions, ErrorCode, Repository, Revwalk, Sort};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::models::{Pattern, PatternExtras, PatternType};

static CONVENTIONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<kind>[A-Za-z]+)(?:\((?P<scope>[^)]*)\))?(?P<breaking>!)?:\s*(?P<subject>.+)$")
        .expect("conventional commit regex is valid")
});

const AUTOMATED_MESSAGES: &[&str] = &[
    "Merge pull request",
    "Merge branch",
    "Auto-generated",
    "Automated commit",
    "Version bump",
    "[skip ci]",
    "[ci skip]",
];

const BOT_MARKERS: &[&str] = &["[bot]", "dependabot", "renovate", "github-actions"];

/// Separators that may precede `bot` at the end of an email local part.
const BOT_LOCAL_SEPARATORS: &[char] = &['-', '_', '.', '+'];

const GENERATED_FILES: &[&str] = &[
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Gemfile.lock",
    "composer.lock",
    "go.sum",
];

const GENERATED_DIRS: &[&str] = &["dist/", "vendor/", "node_modules/", "target/"];

/// Added-line prefixes that identify a framework.
const FRAMEWORK_IMPORTS: &[(&str, &str)] = &[
    ("use axum", "axum"),
    ("use actix_web", "actix"),
    ("use tokio", "tokio"),
    ("#[tokio::", "tokio"),
    ("use sqlx", "sqlx"),
    ("use serde", "serde"),
    ("from fastapi", "fastapi"),
    ("import fastapi", "fastapi"),
    ("from django", "django"),
    ("import django", "django"),
    ("from flask", "flask"),
    ("import torch", "pytorch"),
    ("from torch", "pytorch"),
    ("import React", "react"),
    ("import react", "react"),
    ("require('express')", "express"),
    ("require(\"express\")", "express"),
    ("from '@angular", "angular"),
    ("from 'vue'", "vue"),
];

/// Added lines scanned per revision for framework imports.
const MAX_SCANNED_LINES: usize = 4000;

const MAX_LISTED_PATHS: usize = 5;
const MAX_BODY_CHARS: usize = 300;

/// Bounds for one extraction run.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Revisions to visit (skipped ones included).
    pub max_revisions: usize,
    /// Inclusive lower bound on revision time, unix seconds.
    pub since: Option<i64>,
    /// Inclusive upper bound on revision time, unix seconds.
    pub until: Option<i64>,
    /// Keep a revision only if one of its paths matches.
    pub path_glob: Option<GlobSet>,
}

impl ExtractOptions {
    pub fn new(max_revisions: usize) -> Self {
        Self {
            max_revisions,
            ..Self::default()
        }
    }
}

/// Counters for what an iterator has visited so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub scanned: usize,
    pub merges: usize,
    pub automated: usize,
    pub empty: usize,
    pub filtered: usize,
    pub extracted: usize,
}

pub struct PatternExtractor {
    repo: Repository,
}

impl PatternExtractor {
    /// Open the repository at `path` (or the one containing it).
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path)
            .map_err(|e| Error::repo(format!("open {}", path.display()), e))?;
        Ok(Self { repo })
    }

    /// Patterns from the newest `max_revisions` revisions reachable from HEAD.
    pub fn extract(&self, max_revisions: usize) -> Result<PatternIter<'_>> {
        self.extract_with(ExtractOptions::new(max_revisions))
    }

    pub fn extract_with(&self, options: ExtractOptions) -> Result<PatternIter<'_>> {
        let walk = match self.repo.head() {
            Ok(_) => {
                let mut walk = self
                    .repo
                    .revwalk()
                    .map_err(|e| Error::repo("create revwalk", e))?;
                walk.set_sorting(Sort::TIME)
                    .map_err(|e| Error::repo("sort revwalk", e))?;
                walk.push_head().map_err(|e| Error::repo("push HEAD", e))?;
                Some(walk)
            }
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                tracing::info!("repository has no commits yet");
                None
            }
            Err(e) => return Err(Error::repo("resolve HEAD", e)),
        };

        Ok(PatternIter {
            repo: &self.repo,
            walk,
            options,
            stats: ExtractStats::default(),
        })
    }
}

/// Lazy sequence of patterns, newest revision first.
pub struct PatternIter<'repo> {
    repo: &'repo Repository,
    walk: Option<Revwalk<'repo>>,
    options: ExtractOptions,
    stats: ExtractStats,
}

impl PatternIter<'_> {
    pub fn stats(&self) -> ExtractStats {
        self.stats
    }

    fn visit(&mut self, commit: &Commit<'_>) -> Result<Option<Pattern>> {
        if commit.parent_count() > 1 {
            self.stats.merges += 1;
            tracing::debug!(rev = %commit.id(), "skipping merge revision");
            return Ok(None);
        }

        let message = String::from_utf8_lossy(commit.message_bytes()).into_owned();
        let author = commit.author();
        let author_name = String::from_utf8_lossy(author.name_bytes()).into_owned();
        let author_email = String::from_utf8_lossy(author.email_bytes()).into_owned();

        if is_automated(&author_name, &author_email, &message) {
            self.stats.automated += 1;
            tracing::debug!(rev = %commit.id(), "skipping automated revision");
            return Ok(None);
        }

        let change = read_change(self.repo, commit)?;
        if change.paths.is_empty() {
            self.stats.empty += 1;
            return Ok(None);
        }
        if change.paths.iter().all(|p| is_generated(p)) {
            self.stats.automated += 1;
            tracing::debug!(rev = %commit.id(), "skipping generated-only revision");
            return Ok(None);
        }
        if let Some(glob) = &self.options.path_glob {
            if !change.paths.iter().any(|p| glob.is_match(p)) {
                self.stats.filtered += 1;
                return Ok(None);
            }
        }

        let pattern = build_pattern(
            &commit.id().to_string(),
            &message,
            &author_name,
            commit.time().seconds(),
            change,
        );
        self.stats.extracted += 1;
        Ok(Some(pattern))
    }
}

impl Iterator for PatternIter<'_> {
    type Item = Result<Pattern>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.stats.scanned >= self.options.max_revisions {
                return None;
            }
            let oid = match self.walk.as_mut()?.next()? {
                Ok(oid) => oid,
                Err(e) => return Some(Err(Error::repo("walk history", e))),
            };
            let repo = self.repo;
            let commit = match repo.find_commit(oid) {
                Ok(c) => c,
                Err(e) => return Some(Err(Error::repo(format!("read revision {}", oid), e))),
            };

            let time = commit.time().seconds();
            if let Some(until) = self.options.until {
                if time > until {
                    continue;
                }
            }
            if let Some(since) = self.options.since {
                if time < since {
                    // Time-sorted walk: everything after this is older.
                    self.walk = None;
                    return None;
                }
            }

            self.stats.scanned += 1;
            match self.visit(&commit) {
                Ok(Some(p)) => return Some(Ok(p)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Paths and added-line signals of one revision's diff against its parent.
struct Change {
    paths: Vec<String>,
    frameworks: BTreeSet<String>,
    insertions: usize,
    deletions: usize,
}

fn read_change(repo: &Repository, commit: &Commit<'_>) -> Result<Change> {
    let rev = commit.id();
    let tree = commit
        .tree()
        .map_err(|e| Error::repo(format!("tree of {}", rev), e))?;
    let parent_tree = if commit.parent_count() == 0 {
        None
    } else {
        let parent = commit
            .parent(0)
            .map_err(|e| Error::repo(format!("parent of {}", rev), e))?;
        Some(
            parent
                .tree()
                .map_err(|e| Error::repo(format!("parent tree of {}", rev), e))?,
        )
    };

    let mut opts = DiffOptions::new();
    opts.ignore_submodules(true);
    let diff = repo
        .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))
        .map_err(|e| Error::repo(format!("diff {}", rev), e))?;

    let mut paths: Vec<String> = diff
        .deltas()
        .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()))
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect();
    paths.sort();
    paths.dedup();

    let (insertions, deletions) = match diff.stats() {
        Ok(s) => (s.insertions(), s.deletions()),
        Err(_) => (0, 0),
    };

    let mut frameworks = BTreeSet::new();
    let mut scanned = 0usize;
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if line.origin() == '+' {
            scanned += 1;
            let text = String::from_utf8_lossy(line.content());
            let text = text.trim_start();
            for (needle, tag) in FRAMEWORK_IMPORTS {
                if text.starts_with(needle) {
                    frameworks.insert((*tag).to_string());
                }
            }
        }
        scanned < MAX_SCANNED_LINES
    })
    .or_else(|e| {
        // Returning false from the callback stops the walk and surfaces as a user error.
        if e.code() == ErrorCode::User {
            Ok(())
        } else {
            Err(Error::repo(format!("read patch of {}", rev), e))
        }
    })?;

    Ok(Change {
        paths,
        frameworks,
        insertions,
        deletions,
    })
}

fn build_pattern(
    revision_id: &str,
    message: &str,
    author: &str,
    created_at: i64,
    change: Change,
) -> Pattern {
    let subject_line = message.lines().next().unwrap_or("").trim();
    let conventional = parse_conventional(subject_line);
    let pattern_type = infer_type(conventional.as_ref(), &change.paths);
    let subject = conventional
        .as_ref()
        .map(|c| c.subject.as_str())
        .unwrap_or(subject_line);

    let mut tags = infer_tags(&change.paths);
    tags.extend(change.frameworks.iter().cloned());

    let primary = primary_path(&change.paths);
    let related_paths: Vec<String> = change
        .paths
        .iter()
        .filter(|p| **p != primary)
        .cloned()
        .collect();

    let description = describe(
        pattern_type,
        subject,
        conventional.as_ref().and_then(|c| c.scope.as_deref()),
        body_of(message),
        &change.paths,
        &tags,
    );

    Pattern {
        id: Pattern::derive_id(revision_id, &primary),
        revision_id: revision_id.to_string(),
        revision_message: message.trim_end().to_string(),
        file_path: primary,
        pattern_type,
        tags,
        created_at,
        description,
        extras: PatternExtras {
            related_paths,
            author: (!author.is_empty()).then(|| author.to_string()),
            scope: conventional.as_ref().and_then(|c| c.scope.clone()),
            breaking: conventional.as_ref().is_some_and(|c| c.breaking),
            insertions: change.insertions,
            deletions: change.deletions,
            other: Default::default(),
        },
    }
}

/// Parsed `type(scope)!: subject` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conventional {
    pub kind: String,
    pub scope: Option<String>,
    pub breaking: bool,
    pub subject: String,
}

pub fn parse_conventional(subject_line: &str) -> Option<Conventional> {
    let caps = CONVENTIONAL.captures(subject_line)?;
    Some(Conventional {
        kind: caps["kind"].to_ascii_lowercase(),
        scope: caps
            .name("scope")
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty()),
        breaking: caps.name("breaking").is_some(),
        subject: caps["subject"].trim().to_string(),
    })
}

/// Prefix first, then path heuristics, then the generic
/// `FeatureImplementation`.
pub fn infer_type(conventional: Option<&Conventional>, paths: &[String]) -> PatternType {
    if let Some(c) = conventional {
        let arch_scope = matches!(c.scope.as_deref(), Some("arch" | "architecture"));
        if c.breaking || arch_scope {
            return PatternType::Architecture;
        }
        match c.kind.as_str() {
            "feat" | "feature" => return PatternType::FeatureImplementation,
            "fix" | "bugfix" | "hotfix" => return PatternType::BugFix,
            "refactor" | "perf" | "style" => return PatternType::Refactoring,
            "docs" | "doc" => return PatternType::Documentation,
            "test" | "tests" => return PatternType::Test,
            "chore" | "build" | "ci" | "config" => return PatternType::Configuration,
            _ => {}
        }
    }

    if paths.is_empty() {
        return PatternType::FeatureImplementation;
    }
    if paths.iter().all(|p| is_doc_path(p)) {
        PatternType::Documentation
    } else if paths.iter().all(|p| is_test_path(p)) {
        PatternType::Test
    } else if paths.iter().all(|p| is_config_path(p)) {
        PatternType::Configuration
    } else {
        PatternType::FeatureImplementation
    }
}

/// Language tags from extensions plus framework tags from path shapes.
/// Unknown extensions contribute nothing.
pub fn infer_tags(paths: &[String]) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    for path in paths {
        if let Some(lang) = language_of(path) {
            tags.insert(lang.to_string());
        }
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".jsx") || lower.ends_with(".tsx") || has_segment(&lower, "react") {
            tags.insert("react".to_string());
        }
        if has_segment(&lower, "fastapi") {
            tags.insert("fastapi".to_string());
        }
        if has_segment(&lower, "django") {
            tags.insert("django".to_string());
        }
        let file = lower.rsplit('/').next().unwrap_or(&lower);
        if file == "dockerfile" || file.starts_with("docker-compose") {
            tags.insert("docker".to_string());
        }
        if lower.starts_with(".github/workflows/") {
            tags.insert("github-actions".to_string());
        }
    }
    tags
}

/// Some path segment, or its stem, is exactly `name`.
fn has_segment(path: &str, name: &str) -> bool {
    path.split('/')
        .any(|seg| seg == name || seg.split('.').next() == Some(name))
}

fn language_of(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "rs" => "rust",
        "py" => "python",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        _ => return None,
    })
}

fn is_doc_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".md")
        || lower.ends_with(".rst")
        || lower.ends_with(".txt")
        || lower.starts_with("docs/")
        || lower.contains("/docs/")
}

fn is_test_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let file = lower.rsplit('/').next().unwrap_or(&lower);
    lower.starts_with("tests/")
        || lower.contains("/tests/")
        || lower.contains("/test/")
        || lower.contains("__tests__/")
        || file.starts_with("test_")
        || file.contains("_test.")
        || file.contains(".test.")
        || file.contains(".spec.")
}

fn is_config_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let file = lower.rsplit('/').next().unwrap_or(&lower);
    [".toml", ".yaml", ".yml", ".json", ".ini", ".cfg", ".env"]
        .iter()
        .any(|ext| file.ends_with(ext))
        || file.starts_with('.')
        || file == "dockerfile"
        || file == "makefile"
}

fn is_generated(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    GENERATED_FILES.contains(&file)
        || file.ends_with(".min.js")
        || file.ends_with(".min.css")
        || GENERATED_DIRS
            .iter()
            .any(|d| path.starts_with(d) || path.contains(&format!("/{}", d)))
}

fn is_automated(author_name: &str, author_email: &str, message: &str) -> bool {
    let who = format!("{} {}", author_name, author_email).to_ascii_lowercase();
    BOT_MARKERS.iter().any(|m| who.contains(m))
        || is_bot_local_part(&author_email.to_ascii_lowercase())
        || AUTOMATED_MESSAGES.iter().any(|m| message.contains(m))
}

/// `bot@…`, `ci-bot@…`, `release_bot@…`; not `robot@…`.
fn is_bot_local_part(email: &str) -> bool {
    let local = email.split('@').next().unwrap_or("");
    match local.strip_suffix("bot") {
        Some("") => true,
        Some(rest) => rest.ends_with(BOT_LOCAL_SEPARATORS),
        None => false,
    }
}

/// Representative path: the first source file that is not a test or doc,
/// else the first path. `paths` must be sorted and non-empty.
fn primary_path(paths: &[String]) -> String {
    paths
        .iter()
        .find(|p| language_of(p).is_some() && !is_test_path(p) && !is_doc_path(p))
        .or_else(|| paths.first())
        .cloned()
        .unwrap_or_default()
}

/// First paragraph after the subject line, shortened.
fn body_of(message: &str) -> Option<String> {
    let body = message.split_once('\n')?.1.trim();
    let para = body.split("\n\n").next()?.split_whitespace().collect::<Vec<_>>().join(" ");
    if para.is_empty() {
        return None;
    }
    if para.chars().count() > MAX_BODY_CHARS {
        let cut: String = para.chars().take(MAX_BODY_CHARS).collect();
        Some(format!("{}...", cut.trim_end()))
    } else {
        Some(para)
    }
}

fn describe(
    pattern_type: PatternType,
    subject: &str,
    scope: Option<&str>,
    body: Option<String>,
    paths: &[String],
    tags: &BTreeSet<String>,
) -> String {
    let mut label = pattern_type.label().to_string();
    if let Some(first) = label.get_mut(0..1) {
        first.make_ascii_uppercase();
    }

    let mut out = match scope {
        Some(scope) => format!("{} in {}: {}", label, scope, subject),
        None => format!("{}: {}", label, subject),
    };
    if !out.ends_with('.') {
        out.push('.');
    }
    if let Some(body) = body {
        out.push(' ');
        out.push_str(&body);
    }

    let listed: Vec<&str> = paths.iter().take(MAX_LISTED_PATHS).map(String::as_str).collect();
    out.push_str(&format!(
        " Touches {} file{}: {}",
        paths.len(),
        if paths.len() == 1 { "" } else { "s" },
        listed.join(", ")
    ));
    if paths.len() > MAX_LISTED_PATHS {
        out.push_str(&format!(" and {} more", paths.len() - MAX_LISTED_PATHS));
    }
    out.push('.');

    if !tags.is_empty() {
        let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
        out.push_str(&format!(" Tags: {}.", tags.join(", ")));
    }
    out
}

/// Build a matcher from a single glob such as `src/**/*.rs`.
pub fn build_glob(pattern: &str) -> Result<GlobSet> {
    let glob = Glob::new(pattern)
        .map_err(|e| Error::InvalidInput(format!("invalid glob '{}': {}", pattern, e)))?;
    GlobSetBuilder::new()
        .add(glob)
        .build()
        .map_err(|e| Error::InvalidInput(format!("invalid glob '{}': {}", pattern, e)))
}

/// Parse `YYYY-MM-DD` as the start (or end) of that UTC day.
pub fn parse_date(s: &str, end_of_day: bool) -> Result<i64> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::InvalidInput(format!("invalid date '{}': {}", s, e)))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc().timestamp())
        .ok_or_else(|| Error::InvalidInput(format!("invalid date '{}'", s)))
}

#[cfg(test)]
pub(crate) mod fixture {
    //! Programmatic git repositories for tests.

    use git2::{Commit, Oid, Repository, Signature, Time};
    use std::path::Path;

    pub fn init(dir: &Path) -> Repository {
        Repository::init(dir).unwrap()
    }

    /// Write `files` into the work tree and commit them on HEAD.
    pub fn commit(
        repo: &Repository,
        files: &[(&str, &str)],
        message: &str,
        author: &str,
        time: i64,
    ) -> Oid {
        let workdir = repo.workdir().unwrap().to_path_buf();
        let mut index = repo.index().unwrap();
        for (path, content) in files {
            let full = workdir.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&full, content).unwrap();
            index.add_path(Path::new(path)).unwrap();
        }
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::new(
            author,
            &format!("{}@example.com", author.replace(' ', ".")),
            &Time::new(time, 0),
        )
        .unwrap();
        let parents: Vec<Commit<'_>> = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().unwrap()],
            Err(_) => Vec::new(),
        };
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap()
    }

    /// Record a merge of `other` into HEAD without changing the tree.
    pub fn merge(repo: &Repository, other: Oid, time: i64) -> Oid {
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        let other = repo.find_commit(other).unwrap();
        let tree = head.tree().unwrap();
        let sig = Signature::new("Dev", "dev@example.com", &Time::new(time, 0)).unwrap();
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            "Merge branch 'topic'",
            &tree,
            &[&head, &other],
        )
        .unwrap()
    }
}
