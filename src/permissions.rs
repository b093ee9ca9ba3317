//! Permission sets and path-scoped access rules.
//!
//! A [`Permissions`] value is the Create/Read/Update/Delete capability set
//! attached to the global config, to each user, and to each rule. Rules
//! match a request path by prefix or by regular expression; the rule list
//! is resolved last-match-wins, so later rules override earlier, more
//! general ones.

use std::path::PathBuf;

use bitflags::bitflags;
use futures_util::future::BoxFuture;
use http::Method;
use regex::Regex;
use serde::Deserialize;

bitflags! {
    /// Capability set, parseable from the compact `"CRUD"` text form.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u8 {
        const CREATE = 0b0001;
        const READ = 0b0010;
        const UPDATE = 0b0100;
        const DELETE = 0b1000;
    }
}

impl std::str::FromStr for Permissions {
    type Err = InvalidPermissions;

    /// Parses `"none"` or any combination of the letters `c`, `r`, `u`,
    /// `d` (case-insensitive). Unknown letters are an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("none") {
            return Ok(Permissions::empty());
        }
        let mut perms = Permissions::empty();
        for c in s.chars() {
            match c.to_ascii_lowercase() {
                'c' => perms |= Permissions::CREATE,
                'r' => perms |= Permissions::READ,
                'u' => perms |= Permissions::UPDATE,
                'd' => perms |= Permissions::DELETE,
                _ => return Err(InvalidPermissions(c)),
            }
        }
        Ok(perms)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid permission: {0:?}")]
pub struct InvalidPermissions(char);

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How a rule selects the paths it applies to.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// String-prefix match on the request path.
    Prefix(String),
    /// Regular-expression match on the request path.
    Regex(Regex),
}

/// One element of the ordered rule list.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawRule")]
pub struct Rule {
    pub matcher: Matcher,
    pub permissions: Permissions,
}

impl Rule {
    pub fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            Matcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Matcher::Regex(re) => re.is_match(path),
        }
    }
}

// The configuration surface keeps the two-field form; exactly one of
// `path` and `regex` must be present.
#[derive(Debug, Deserialize)]
struct RawRule {
    path: Option<String>,
    regex: Option<String>,
    permissions: Permissions,
}

impl TryFrom<RawRule> for Rule {
    type Error = RuleError;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        let matcher = match (raw.path, raw.regex) {
            (Some(path), None) => Matcher::Prefix(path),
            (None, Some(pattern)) => Matcher::Regex(Regex::new(&pattern)?),
            (Some(_), Some(_)) => return Err(RuleError::BothMatchers),
            (None, None) => return Err(RuleError::NoMatcher),
        };
        Ok(Rule {
            matcher,
            permissions: raw.permissions,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rule: cannot define both regex and path")]
    BothMatchers,
    #[error("invalid rule: one of regex or path must be defined")]
    NoMatcher,
    #[error("invalid rule: {0}")]
    BadPattern(#[from] regex::Error),
}

/// Existence probe supplied by the front-end, evaluated in the user's
/// filesystem root. Called at most once per side of a request, and only
/// for the verbs whose capability mapping depends on it.
pub trait PathLookup: Send + Sync {
    fn exists<'a>(&'a self, path: &'a str) -> BoxFuture<'a, bool>;
}

/// Permission envelope shared by the global config and each user.
#[derive(Debug, Clone)]
pub struct UserPermissions {
    /// Absolute path serving as the user's filesystem root.
    pub directory: PathBuf,
    /// Capabilities that apply when no rule matches.
    pub permissions: Permissions,
    /// Ordered rule list, resolved last-match-wins.
    pub rules: Vec<Rule>,
}

impl UserPermissions {
    /// Whether this envelope allows `method` on `path`.
    ///
    /// `path` and `destination` are prefix-stripped URL paths. For COPY
    /// and MOVE the destination is checked first and a denial there
    /// short-circuits the request; a missing destination denies outright.
    pub async fn allowed(
        &self,
        method: &Method,
        path: &str,
        destination: Option<&str>,
        fs: &dyn PathLookup,
    ) -> bool {
        if matches!(method.as_str(), "COPY" | "MOVE") {
            let Some(dst) = destination else {
                return false;
            };
            if !self.resolve(dst).allows_destination(dst, fs).await {
                return false;
            }
        }

        self.resolve(path).allows_source(method, path, fs).await
    }

    // Scan the rules from the last to the first; the first match is the
    // sole authority for the path. No match falls back to the defaults.
    fn resolve(&self, path: &str) -> Permissions {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(path))
            .map(|rule| rule.permissions)
            .unwrap_or(self.permissions)
    }
}

impl Permissions {
    /// Capability required to execute `method` at the source path.
    async fn allows_source(self, method: &Method, path: &str, fs: &dyn PathLookup) -> bool {
        match method.as_str() {
            // POST is served by the backend the same way as GET.
            "GET" | "HEAD" | "OPTIONS" | "POST" | "PROPFIND" => self.contains(Permissions::READ),
            "MKCOL" => self.contains(Permissions::CREATE),
            "PROPPATCH" => self.contains(Permissions::UPDATE),
            "PUT" => {
                if fs.exists(path).await {
                    self.contains(Permissions::UPDATE)
                } else {
                    self.contains(Permissions::CREATE)
                }
            }
            "COPY" => self.contains(Permissions::READ),
            "MOVE" => self.contains(Permissions::READ | Permissions::DELETE),
            "DELETE" => self.contains(Permissions::DELETE),
            "LOCK" | "UNLOCK" => !self.is_empty(),
            _ => false,
        }
    }

    /// Capability required at the destination path of a COPY or MOVE:
    /// Update when the target exists, Create otherwise.
    async fn allows_destination(self, path: &str, fs: &dyn PathLookup) -> bool {
        if fs.exists(path).await {
            self.contains(Permissions::UPDATE)
        } else {
            self.contains(Permissions::CREATE)
        }
    }
}
