use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Group and optional subtype parsed from a table's display name.
///
/// Tables sharing a group and differing only in subtype are merge candidates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdentity {
    pub group: String,
    pub subtype: Option<String>,
}

impl TableIdentity {
    /// Parse a display name. Rules, in priority order:
    ///
    /// 1. `Name(Subtype)`
    /// 2. `Name[Subtype]`
    /// 3. `Name_subtype` when the last underscore segment is all lowercase
    ///    letters (a capitalised or numeric segment is part of the group name)
    ///
    /// Anything else resolves to `(name, None)`.
    pub fn parse(display_name: &str) -> Self {
        let name = display_name.trim();

        for re in [paren_pattern(), bracket_pattern()] {
            if let Some(caps) = re.captures(name) {
                return TableIdentity {
                    group: caps["group"].trim().to_string(),
                    subtype: Some(caps["sub"].trim().to_string()),
                };
            }
        }

        if let Some(caps) = underscore_pattern().captures(name) {
            return TableIdentity {
                group: caps["group"].to_string(),
                subtype: Some(caps["sub"].to_string()),
            };
        }

        TableIdentity {
            group: name.to_string(),
            subtype: None,
        }
    }

    /// Subtype label used for merge ordering and provenance.
    pub fn subtype_or_default(&self) -> &str {
        self.subtype.as_deref().unwrap_or(DEFAULT_SUBTYPE)
    }

    pub fn has_subtype(&self) -> bool {
        self.subtype.is_some()
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subtype {
            Some(sub) => write!(f, "{}({})", self.group, sub),
            None => write!(f, "{}", self.group),
        }
    }
}

/// Subtype assigned to a group member whose name carries none.
pub const DEFAULT_SUBTYPE: &str = "default";

fn paren_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<group>.*[^\s(])\s*\((?P<sub>[^()]*\S[^()]*)\)$").expect("valid regex")
    })
}

fn bracket_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<group>.*[^\s\[])\s*\[(?P<sub>[^\[\]]*\S[^\[\]]*)\]$").expect("valid regex")
    })
}

fn underscore_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<group>.*[^_])_(?P<sub>[a-z]+)$").expect("valid regex"))
}
