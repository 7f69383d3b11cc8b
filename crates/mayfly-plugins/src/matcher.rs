//! Match rules: which identifiers a plugin claims

use mayfly_common::DeviceIdentifier;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// A declarative claim over device identifiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchRule {
    /// MAC identifiers starting with this prefix (any separator style)
    MacPrefix { prefix: String },
    /// Filename identifiers matching this regex
    Filename { pattern: String },
    /// Vendor/model tokens matching this regex
    Token { pattern: String },
    /// Any MAC identifier
    MacAny,
}

#[derive(Debug)]
enum CompiledRule {
    MacPrefix(String),
    Filename(Regex),
    Token(Regex),
    MacAny,
}

impl CompiledRule {
    fn matches(&self, id: &DeviceIdentifier) -> bool {
        match (self, id) {
            (CompiledRule::MacPrefix(prefix), DeviceIdentifier::Mac(mac)) => {
                mac.to_bare(false).starts_with(prefix.as_str())
            }
            (CompiledRule::MacAny, DeviceIdentifier::Mac(_)) => true,
            (CompiledRule::Filename(re), DeviceIdentifier::Filename(name)) => re.is_match(name),
            (CompiledRule::Token(re), DeviceIdentifier::Token(token)) => re.is_match(token),
            _ => false,
        }
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, String> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| format!("invalid pattern {:?}: {}", pattern, e))
}

/// Hex digits of a prefix like `00:11:22`, `00-11-22` or `001122`
fn compile_prefix(prefix: &str) -> Result<String, String> {
    let digits: String = prefix
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect::<String>()
        .to_lowercase();
    if digits.is_empty() || digits.len() > 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid MAC prefix {:?}", prefix));
    }
    Ok(digits)
}

/// A compiled set of rules; matches when any rule matches
#[derive(Debug)]
pub struct Matcher {
    rules: Vec<MatchRule>,
    compiled: Vec<CompiledRule>,
}

impl Matcher {
    pub fn compile(rules: &[MatchRule]) -> Result<Self, String> {
        let compiled = rules
            .iter()
            .map(|rule| {
                Ok(match rule {
                    MatchRule::MacPrefix { prefix } => CompiledRule::MacPrefix(compile_prefix(prefix)?),
                    MatchRule::Filename { pattern } => CompiledRule::Filename(compile_regex(pattern)?),
                    MatchRule::Token { pattern } => CompiledRule::Token(compile_regex(pattern)?),
                    MatchRule::MacAny => CompiledRule::MacAny,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Self {
            rules: rules.to_vec(),
            compiled,
        })
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    pub fn matches(&self, id: &DeviceIdentifier) -> bool {
        self.compiled.iter().any(|rule| rule.matches(id))
    }
}
