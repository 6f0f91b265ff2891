use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::PathError;

/// Predicate name used for leaf-list instances, as in `[.='v']`.
pub const SELF_PREDICATE: &str = ".";

/// Identity of one data node among its siblings.
///
/// Keyed list entries and leaf-list instances carry their keys as
/// predicates, so two instances with the same keys are the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub name: String,
    /// Sorted by predicate name
    pub predicates: Vec<(String, String)>,
}

impl NodeKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicates: vec![],
        }
    }

    pub fn with_predicate(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.predicates.push((key.into(), value.into()));
        self.predicates.sort();
        self
    }

    /// Module prefix of a top-level name (`mod:name`).
    pub fn module(&self) -> Option<&str> {
        self.name.split_once(':').map(|(module, _)| module)
    }

    /// True if `child` is the leaf that mirrors one of this entry's keys.
    pub fn is_key_leaf(
        &self,
        child: &NodeKey,
    ) -> bool {
        child.predicates.is_empty() && self.predicates.iter().any(|(k, _)| *k == child.name)
    }

    pub fn leaf_list_value(&self) -> Option<&str> {
        self.predicates
            .iter()
            .find(|(k, _)| k == SELF_PREDICATE)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for NodeKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.name)?;
        write_predicates(f, &self.predicates)
    }
}

fn write_predicates(
    f: &mut fmt::Formatter<'_>,
    predicates: &[(String, String)],
) -> fmt::Result {
    for (key, value) in predicates {
        if value.contains('\'') {
            write!(f, "[{key}=\"{value}\"]")?;
        } else {
            write!(f, "[{key}='{value}']")?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepName {
    /// `*`
    Any,
    /// `mod:*`
    AnyInModule(String),
    Named(String),
}

/// One `/`-separated segment of an [`XPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Step {
    pub name: StepName,
    pub predicates: Vec<(String, String)>,
}

impl Step {
    /// Name matches and every predicate of the step is a key of the node.
    pub fn matches(
        &self,
        key: &NodeKey,
    ) -> bool {
        let name_ok = match &self.name {
            StepName::Any => true,
            StepName::AnyInModule(module) => key.module() == Some(module.as_str()),
            StepName::Named(name) => *name == key.name,
        };
        name_ok && self.predicates.iter().all(|p| key.predicates.contains(p))
    }

    /// Whether some node could match both steps.
    fn compatible(
        &self,
        other: &Step,
    ) -> bool {
        let names_ok = match (&self.name, &other.name) {
            (StepName::Named(a), StepName::Named(b)) => a == b,
            (StepName::Named(n), StepName::AnyInModule(m)) | (StepName::AnyInModule(m), StepName::Named(n)) => {
                n.split_once(':').map(|(module, _)| module) == Some(m.as_str())
            }
            (StepName::AnyInModule(a), StepName::AnyInModule(b)) => a == b,
            (StepName::Any, _) | (_, StepName::Any) => true,
        };
        names_ok
            && self.predicates.iter().all(|(k, v)| {
                other
                    .predicates
                    .iter()
                    .all(|(ok, ov)| ok != k || ov == v)
            })
    }

    fn is_wildcard(&self) -> bool {
        !matches!(self.name, StepName::Named(_))
    }
}

impl fmt::Display for Step {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match &self.name {
            StepName::Any => f.write_str("*")?,
            StepName::AnyInModule(module) => write!(f, "{module}:*")?,
            StepName::Named(name) => f.write_str(name)?,
        }
        write_predicates(f, &self.predicates)
    }
}

/// Absolute path expression: `/mod:top/list[key='v']/leaf-list[.='x']`.
///
/// `/` alone selects everything; `*` and `mod:*` match any sibling name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XPath {
    steps: Vec<Step>,
}

impl XPath {
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let trimmed = input.trim();
        let mut rest = trimmed
            .strip_prefix('/')
            .ok_or_else(|| PathError::NotAbsolute(input.to_string()))?;
        if rest.is_empty() {
            return Ok(Self::root());
        }

        let mut steps = Vec::new();
        loop {
            let (step, remaining) = parse_step(rest, input)?;
            steps.push(step);
            if remaining.is_empty() {
                break;
            }
            rest = remaining.strip_prefix('/').ok_or_else(|| PathError::MalformedPredicate {
                path: input.to_string(),
                reason: format!("unexpected '{remaining}'"),
            })?;
        }

        if let Some(StepName::Named(first)) = steps.first().map(|s| &s.name) {
            if !first.contains(':') {
                return Err(PathError::MissingModule(input.to_string()));
            }
        }
        Ok(Self { steps })
    }

    /// Selects the whole tree.
    pub fn root() -> Self {
        Self { steps: vec![] }
    }

    pub fn from_keys(keys: &[NodeKey]) -> Self {
        Self {
            steps: keys
                .iter()
                .map(|key| Step {
                    name: StepName::Named(key.name.clone()),
                    predicates: key.predicates.clone(),
                })
                .collect(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }

    /// Module named by the first step, if it names one.
    pub fn module(&self) -> Option<&str> {
        match &self.steps.first()?.name {
            StepName::Any => None,
            StepName::AnyInModule(module) => Some(module),
            StepName::Named(name) => name.split_once(':').map(|(module, _)| module),
        }
    }

    pub fn is_concrete(&self) -> bool {
        !self.steps.iter().any(Step::is_wildcard)
    }

    /// Keys of the single node this path addresses. Edits need these.
    pub fn to_keys(&self) -> Result<Vec<NodeKey>, PathError> {
        if self.steps.is_empty() {
            return Err(PathError::EmptySegment("/".to_string()));
        }
        self.steps
            .iter()
            .map(|step| match &step.name {
                StepName::Named(name) => Ok(NodeKey {
                    name: name.clone(),
                    predicates: step.predicates.clone(),
                }),
                _ => Err(PathError::WildcardInEdit(self.to_string())),
            })
            .collect()
    }

    /// True if the node at `keys` is selected by this path or lies inside a
    /// selected subtree.
    pub fn covers(
        &self,
        keys: &[NodeKey],
    ) -> bool {
        keys.len() >= self.steps.len() && self.steps.iter().zip(keys).all(|(step, key)| step.matches(key))
    }

    /// True if the node at `keys` is a strict ancestor of a node this path
    /// could select.
    pub fn leads_to(
        &self,
        keys: &[NodeKey],
    ) -> bool {
        keys.len() < self.steps.len() && self.steps.iter().zip(keys).all(|(step, key)| step.matches(key))
    }

    /// True if every node selected by `other` is also covered by `self`.
    pub fn covers_path(
        &self,
        other: &XPath,
    ) -> bool {
        other.steps.len() >= self.steps.len()
            && self.steps.iter().zip(&other.steps).all(|(mine, theirs)| {
                let name_ok = match (&mine.name, &theirs.name) {
                    (StepName::Any, _) => true,
                    (StepName::AnyInModule(m), StepName::AnyInModule(t)) => m == t,
                    (StepName::AnyInModule(m), StepName::Named(n)) => {
                        n.split_once(':').map(|(module, _)| module) == Some(m.as_str())
                    }
                    (StepName::Named(a), StepName::Named(b)) => a == b,
                    _ => false,
                };
                name_ok && mine.predicates.iter().all(|p| theirs.predicates.contains(p))
            })
    }

    /// Whether the two paths can select overlapping data, i.e. one selects
    /// an ancestor, descendant or the same node as the other.
    pub fn intersects(
        &self,
        other: &XPath,
    ) -> bool {
        self.steps.iter().zip(&other.steps).all(|(a, b)| a.compatible(b))
    }
}

impl fmt::Display for XPath {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("/");
        }
        for step in &self.steps {
            write!(f, "/{step}")?;
        }
        Ok(())
    }
}

impl FromStr for XPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_step<'a>(
    input: &'a str,
    full: &str,
) -> Result<(Step, &'a str), PathError> {
    let malformed = |reason: &str| PathError::MalformedPredicate {
        path: full.to_string(),
        reason: reason.to_string(),
    };

    let name_end = input.find(['/', '[']).unwrap_or(input.len());
    let name = input[..name_end].trim();
    if name.is_empty() {
        return Err(PathError::EmptySegment(full.to_string()));
    }
    if name.contains([']', '\'', '"', '=', ' ']) {
        return Err(malformed("invalid node name"));
    }
    let name = match name {
        "*" => StepName::Any,
        _ => match name.strip_suffix(":*") {
            Some(module) if !module.is_empty() => StepName::AnyInModule(module.to_string()),
            _ if name.contains('*') => return Err(malformed("invalid wildcard")),
            _ => StepName::Named(name.to_string()),
        },
    };

    let mut rest = &input[name_end..];
    let mut predicates: Vec<(String, String)> = Vec::new();
    while let Some(body) = rest.strip_prefix('[') {
        let eq = body.find('=').ok_or_else(|| malformed("missing '='"))?;
        let key = body[..eq].trim();
        if key.is_empty() || key.contains([']', '[', '\'', '"', '/']) {
            return Err(malformed("invalid predicate key"));
        }

        let quoted = body[eq + 1..].trim_start();
        let quote = quoted
            .chars()
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .ok_or_else(|| malformed("predicate value must be quoted"))?;
        let value_body = &quoted[1..];
        let close = value_body
            .find(quote)
            .ok_or_else(|| malformed("unterminated predicate value"))?;
        let value = &value_body[..close];

        rest = value_body[close + 1..]
            .trim_start()
            .strip_prefix(']')
            .ok_or_else(|| malformed("missing ']'"))?;

        if predicates.iter().any(|(k, _)| k == key) {
            return Err(malformed("duplicate predicate key"));
        }
        predicates.push((key.to_string(), value.to_string()));
    }
    predicates.sort();

    Ok((Step { name, predicates }, rest))
}
