use crate::{LabelSelector, LabelSelectorRequirement};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

pub type Map = BTreeMap<String, String>;

/// Selects resources by their labels.
///
/// An empty selector matches every resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    match_labels: Map,
    match_expressions: Vec<Expression>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidSelector {
    #[error("unsupported label selector operator: {0}")]
    Operator(String),

    #[error("label selector operator {0:?} requires values")]
    MissingValues(Operator),

    #[error("label selector operator {0:?} does not accept values")]
    UnexpectedValues(Operator),

    #[error("invalid label key: {0:?}")]
    Key(String),

    #[error("invalid label value: {0:?}")]
    Value(String),

    #[error("invalid label selector requirement: {0:?}")]
    Requirement(String),
}

// === impl Selector ===

impl Selector {
    pub fn matches(&self, labels: &Map) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|e| e.matches(labels))
    }
}

impl TryFrom<LabelSelector> for Selector {
    type Error = InvalidSelector;

    fn try_from(selector: LabelSelector) -> Result<Self, Self::Error> {
        let match_expressions = selector
            .match_expressions
            .into_iter()
            .flatten()
            .map(Expression::try_from)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            match_labels: selector.match_labels.unwrap_or_default(),
            match_expressions,
        })
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self {
            match_labels: iter
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            match_expressions: vec![],
        }
    }
}

/// Parses the selector syntax accepted by the Kubernetes API's `labelSelector` parameter, e.g.
/// `env=prod,tier in (web,api),!legacy`.
impl FromStr for Selector {
    type Err = InvalidSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut selector = Self::default();
        if s.trim().is_empty() {
            return Ok(selector);
        }

        for term in split_terms(s) {
            let term = term.trim();
            if let Some(key) = term.strip_prefix('!') {
                selector.match_expressions.push(Expression {
                    key: valid_key(key.trim())?,
                    operator: Operator::DoesNotExist,
                    values: BTreeSet::new(),
                });
            } else if let Some(open) = term.find('(') {
                let values = term[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| InvalidSelector::Requirement(term.to_string()))?;
                let mut head = term[..open].split_whitespace();
                let (Some(key), Some(op), None) = (head.next(), head.next(), head.next()) else {
                    return Err(InvalidSelector::Requirement(term.to_string()));
                };
                let operator = match op {
                    "in" => Operator::In,
                    "notin" => Operator::NotIn,
                    op => return Err(InvalidSelector::Operator(op.to_string())),
                };
                let values = values
                    .split(',')
                    .map(|v| valid_value(v.trim()))
                    .collect::<Result<BTreeSet<_>, _>>()?;
                selector.match_expressions.push(Expression {
                    key: valid_key(key)?,
                    operator,
                    values,
                });
            } else if let Some((key, value)) = term.split_once("!=") {
                selector.match_expressions.push(Expression {
                    key: valid_key(key.trim())?,
                    operator: Operator::NotIn,
                    values: Some(valid_value(value.trim())?).into_iter().collect(),
                });
            } else if let Some((key, value)) = term.split_once('=') {
                let value = value.strip_prefix('=').unwrap_or(value);
                let key = valid_key(key.trim())?;
                let value = valid_value(value.trim())?;
                match selector.match_labels.get(&key) {
                    Some(prior) if *prior != value => {
                        // Contradictory equalities select nothing; keep both so that they do.
                        selector.match_expressions.push(Expression {
                            key,
                            operator: Operator::In,
                            values: Some(value).into_iter().collect(),
                        });
                    }
                    _ => {
                        selector.match_labels.insert(key, value);
                    }
                }
            } else {
                selector.match_expressions.push(Expression {
                    key: valid_key(term)?,
                    operator: Operator::Exists,
                    values: BTreeSet::new(),
                });
            }
        }

        Ok(selector)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for (k, v) in &self.match_labels {
            write!(f, "{sep}{k}={v}")?;
            sep = ",";
        }
        for expr in &self.match_expressions {
            write!(f, "{sep}{expr}")?;
            sep = ",";
        }
        Ok(())
    }
}

/// Splits on commas outside of parentheses.
fn split_terms(s: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&s[start..]);
    terms
}

fn valid_key(key: &str) -> Result<String, InvalidSelector> {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    let prefix_ok = prefix
        .map(|p| {
            !p.is_empty()
                && p.len() <= 253
                && p.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        })
        .unwrap_or(true);
    if prefix_ok && !name.is_empty() && is_label_value(name) {
        Ok(key.to_string())
    } else {
        Err(InvalidSelector::Key(key.to_string()))
    }
}

fn valid_value(value: &str) -> Result<String, InvalidSelector> {
    if value.is_empty() || is_label_value(value) {
        Ok(value.to_string())
    } else {
        Err(InvalidSelector::Value(value.to_string()))
    }
}

fn is_label_value(s: &str) -> bool {
    let alnum = |c: char| c.is_ascii_alphanumeric();
    s.len() <= 63
        && s.starts_with(alnum)
        && s.ends_with(alnum)
        && s.chars()
            .all(|c| alnum(c) || c == '-' || c == '_' || c == '.')
}

// === impl Expression ===

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::In => value.map(|v| self.values.contains(v)).unwrap_or(false),
            Operator::NotIn => value.map(|v| !self.values.contains(v)).unwrap_or(true),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl TryFrom<LabelSelectorRequirement> for Expression {
    type Error = InvalidSelector;

    fn try_from(req: LabelSelectorRequirement) -> Result<Self, Self::Error> {
        let operator = req.operator.parse::<Operator>()?;
        let values = req.values.unwrap_or_default();
        match operator {
            Operator::In | Operator::NotIn if values.is_empty() => {
                return Err(InvalidSelector::MissingValues(operator))
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                return Err(InvalidSelector::UnexpectedValues(operator))
            }
            _ => {}
        }
        Ok(Self {
            key: req.key,
            operator,
            values: values.into_iter().collect(),
        })
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In => write!(f, "{} in ({})", self.key, values()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, values()),
            Operator::Exists => f.write_str(&self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

// === impl Operator ===

impl FromStr for Operator {
    type Err = InvalidSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In" => Ok(Self::In),
            "NotIn" => Ok(Self::NotIn),
            "Exists" => Ok(Self::Exists),
            "DoesNotExist" => Ok(Self::DoesNotExist),
            op => Err(InvalidSelector::Operator(op.to_string())),
        }
    }
}
