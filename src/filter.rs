//! Predicate filters over service descriptions.
//!
//! A [`ServiceFilter`] selects services by name and by a conjunction of
//! [`Rule`]s over their advertised properties. Each rule first narrows the
//! property value with a regular expression (the first capture group if the
//! pattern has one, otherwise the whole match) and then compares the result
//! against a target value. Values that both parse as finite numbers compare
//! numerically; anything else compares as strings.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use tracing::{trace, warn};

use crate::description::ServiceDescription;
use crate::message::{keys, Message};
use crate::{Error, Result};

const MOD_NOT: u32 = 0x1000;
const MASK_OP: u32 = 0x0fff;

/// Comparison applied by a [`Rule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// Substring equals the target.
    Equals,
    /// Substring is greater than the target.
    Greater,
    /// Substring is less than the target.
    Less,
    /// Substring starts with the target.
    StartsWith,
    /// Substring ends with the target.
    EndsWith,
    /// Substring contains the target.
    Contains,
}

impl Operator {
    /// Wire code of this operator.
    pub fn code(self) -> u32 {
        match self {
            Self::Equals => 1,
            Self::Greater => 2,
            Self::Less => 3,
            Self::StartsWith => 4,
            Self::EndsWith => 5,
            Self::Contains => 6,
        }
    }

    /// Operator for a wire code, ignoring modifier bits.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code & MASK_OP {
            1 => Self::Equals,
            2 => Self::Greater,
            3 => Self::Less,
            4 => Self::StartsWith,
            5 => Self::EndsWith,
            6 => Self::Contains,
            _ => return None,
        })
    }
}

/// One predicate over a single property.
///
/// The pattern is compiled once, when the rule is built or decoded. A
/// pattern that does not compile makes the rule match nothing.
#[derive(Clone)]
pub struct Rule {
    key: String,
    pattern: String,
    value: String,
    op: Operator,
    negate: bool,
    regex: Option<Regex>,
}

impl Rule {
    /// Compare the whole property value against `value`.
    pub fn new(key: impl Into<String>, value: impl Into<String>, op: Operator) -> Self {
        Self::from_parts(key.into(), ".*".to_string(), value.into(), op, false)
    }

    fn from_parts(key: String, pattern: String, value: String, op: Operator, negate: bool) -> Self {
        let regex = compile(&key, &pattern);
        Self {
            key,
            pattern,
            value,
            op,
            negate,
            regex,
        }
    }

    /// Use `pattern` to select the compared substring.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self.regex = compile(&self.key, &self.pattern);
        self
    }

    /// Invert the rule.
    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    /// Property the rule reads.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Regular expression selecting the compared substring.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Value the substring is compared against.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Comparison to apply.
    pub fn op(&self) -> Operator {
        self.op
    }

    /// Whether the outcome of the comparison is inverted.
    pub fn is_negated(&self) -> bool {
        self.negate
    }

    /// Wire predicate: operator code with the negation bit.
    pub fn predicate(&self) -> u32 {
        let code = self.op.code();
        if self.negate {
            code | MOD_NOT
        } else {
            code
        }
    }

    fn evaluate(&self, actual: &str) -> bool {
        let Some(regex) = &self.regex else {
            trace!(key = %self.key, pattern = %self.pattern, "rule pattern unusable");
            return false;
        };
        let Some(captures) = regex.captures(actual) else {
            return false;
        };
        let substring = if captures.len() > 1 {
            captures.get(1).map_or("", |m| m.as_str())
        } else {
            captures.get(0).map_or("", |m| m.as_str())
        };

        let ordering = match (parse_number(&self.value), parse_number(substring)) {
            (Some(target), Some(actual)) => actual.partial_cmp(&target),
            _ => Some(substring.cmp(self.value.as_str())),
        };

        let outcome = match self.op {
            Operator::Equals => ordering == Some(Ordering::Equal),
            Operator::Less => ordering == Some(Ordering::Less),
            Operator::Greater => ordering == Some(Ordering::Greater),
            Operator::StartsWith => substring.starts_with(self.value.as_str()),
            Operator::EndsWith => substring.ends_with(self.value.as_str()),
            Operator::Contains => substring.contains(self.value.as_str()),
        };
        outcome ^ self.negate
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.pattern == other.pattern
            && self.value == other.value
            && self.op == other.op
            && self.negate == other.negate
    }
}

impl Eq for Rule {}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("key", &self.key)
            .field("pattern", &self.pattern)
            .field("value", &self.value)
            .field("op", &self.op)
            .field("negate", &self.negate)
            .finish()
    }
}

fn compile(key: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!(%key, %pattern, %err, "rule pattern does not compile");
            None
        }
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Service name plus a conjunction of rules.
///
/// Every filter carries a unique id; continuous queries are keyed by it on
/// both ends of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFilter {
    service_name: String,
    id: String,
    rules: Vec<Rule>,
}

impl ServiceFilter {
    /// Filter matching every service called `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            id: uuid::Uuid::new_v4().to_string(),
            rules: Vec::new(),
        }
    }

    /// Name of the services this filter selects.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Unique id of this filter.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Append a rule.
    pub fn add_rule(&mut self, rule: Rule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    /// Builder form of [`add_rule`](Self::add_rule).
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Remove every rule.
    pub fn clear_rules(&mut self) {
        self.rules.clear();
    }

    /// Whether `desc` satisfies the name and every rule.
    pub fn matches(&self, desc: &ServiceDescription) -> bool {
        if desc.name() != self.service_name {
            return false;
        }
        self.rules.iter().all(|rule| match desc.property(&rule.key) {
            Some(actual) => rule.evaluate(actual),
            None => {
                trace!(key = %rule.key, service = %desc.name(), "property missing");
                false
            }
        })
    }

    /// Encode into discovery metadata.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::new();
        self.write_meta(&mut msg);
        msg
    }

    /// Write the filter entries into `msg`.
    pub fn write_meta(&self, msg: &mut Message) {
        let prefix = keys::FILTER_PREFIX;
        msg.put_meta(format!("{prefix}svcName"), self.service_name.as_str());
        msg.put_meta(format!("{prefix}uuid"), self.id.as_str());
        for (i, rule) in self.rules.iter().enumerate() {
            let key = &rule.key;
            msg.put_meta(format!("{prefix}value.{i}.{key}"), rule.value.as_str());
            msg.put_meta(format!("{prefix}pattern.{i}.{key}"), rule.pattern.as_str());
            msg.put_meta(format!("{prefix}pred.{i}.{key}"), rule.predicate().to_string());
        }
    }

    /// Decode from discovery metadata.
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut service_name = None;
        let mut id = None;
        // index -> (key, value, pattern, pred)
        let mut parts: BTreeMap<usize, RuleParts<'_>> = BTreeMap::new();

        for (suffix, value) in msg.meta_with_prefix(keys::FILTER_PREFIX) {
            match suffix {
                "svcName" => service_name = Some(value),
                "uuid" => id = Some(value),
                _ => {
                    let (field, rest) = suffix
                        .split_once('.')
                        .ok_or_else(|| Error::malformed(format!("filter entry '{suffix}'")))?;
                    let (index, key) = rest
                        .split_once('.')
                        .ok_or_else(|| Error::malformed(format!("filter entry '{suffix}'")))?;
                    let index: usize = index
                        .parse()
                        .map_err(|_| Error::malformed(format!("filter rule index '{index}'")))?;
                    let entry = parts.entry(index).or_default();
                    if entry.key.is_some_and(|k| k != key) {
                        return Err(Error::malformed(format!(
                            "filter rule {index} names two keys"
                        )));
                    }
                    entry.key = Some(key);
                    match field {
                        "value" => entry.value = Some(value),
                        "pattern" => entry.pattern = Some(value),
                        "pred" => entry.pred = Some(value),
                        other => {
                            return Err(Error::malformed(format!("filter field '{other}'")));
                        }
                    }
                }
            }
        }

        let service_name =
            service_name.ok_or_else(|| Error::malformed("filter without service name"))?;
        let id = id.ok_or_else(|| Error::malformed("filter without id"))?;

        let mut rules = Vec::with_capacity(parts.len());
        for (index, part) in parts {
            rules.push(part.into_rule(index)?);
        }

        Ok(Self {
            service_name: service_name.to_string(),
            id: id.to_string(),
            rules,
        })
    }
}

#[derive(Default)]
struct RuleParts<'a> {
    key: Option<&'a str>,
    value: Option<&'a str>,
    pattern: Option<&'a str>,
    pred: Option<&'a str>,
}

impl RuleParts<'_> {
    fn into_rule(self, index: usize) -> Result<Rule> {
        let missing = |what: &str| Error::malformed(format!("filter rule {index} without {what}"));
        let key = self.key.ok_or_else(|| missing("key"))?;
        let value = self.value.ok_or_else(|| missing("value"))?;
        let pattern = self.pattern.ok_or_else(|| missing("pattern"))?;
        let pred = self.pred.ok_or_else(|| missing("predicate"))?;
        let code: u32 = pred
            .parse()
            .map_err(|_| Error::malformed(format!("filter predicate '{pred}'")))?;
        let op = Operator::from_code(code)
            .ok_or_else(|| Error::malformed(format!("unknown filter operator {code}")))?;
        Ok(Rule::from_parts(
            key.to_string(),
            pattern.to_string(),
            value.to_string(),
            op,
            code & MOD_NOT != 0,
        ))
    }
}
