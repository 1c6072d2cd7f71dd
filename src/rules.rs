//! Zone-scoped response rules
//!
//! A rule is an ordered list of components. Predicates select probes by a
//! field of the parsed request; actions reshape the response sent back.
//! Rules of a zone are tried by ascending priority, then insertion order,
//! and the first rule whose predicates all hold supplies the actions.
//!
//! Predicate values match exactly. A value starting with `~` is instead a
//! case-insensitive regular expression searched within the field.

use arc_swap::ArcSwap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, VigilError};
use crate::models::{MatchedRule, Probe, ProbeResponse, Protocol, Rcode};
use crate::registry::normalize_name;

/// Prefix that turns a predicate value into a pattern
const PATTERN_PREFIX: char = '~';

/// Compiled pattern size cap, keeps hostile rules from ballooning memory
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Rule component as exchanged with API clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleComponent {
    pub actionname: String,
    pub actionvalue: String,
    pub ispredicate: bool,
}

/// Probe field a predicate inspects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    DnsQtype,
    DnsName,
    SmtpMailFrom,
    SmtpRcptTo,
    SmtpData,
    SmtpDataContains,
    HttpMethod,
    HttpPath,
    HttpBody,
    HttpHeader(String),
}

impl Field {
    fn parse(name: &str) -> Result<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let field = match lower.as_str() {
            "dns.qtype" | "dns.type" => Field::DnsQtype,
            "dns.name" => Field::DnsName,
            "smtp.mail_from" | "smtp.from" => Field::SmtpMailFrom,
            "smtp.rcpt_to" | "smtp.to" => Field::SmtpRcptTo,
            "smtp.data" => Field::SmtpData,
            "smtp.data.contains" => Field::SmtpDataContains,
            "http.method" => Field::HttpMethod,
            "http.path" => Field::HttpPath,
            "http.body" => Field::HttpBody,
            other => match other.strip_prefix("http.header.") {
                Some(header) if !header.is_empty() => Field::HttpHeader(header.to_string()),
                _ => {
                    return Err(VigilError::MalformedInput(format!(
                        "unknown predicate field '{name}'"
                    )))
                }
            },
        };
        Ok(field)
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Field::DnsQtype | Field::DnsName => Protocol::Dns,
            Field::SmtpMailFrom | Field::SmtpRcptTo | Field::SmtpData | Field::SmtpDataContains => {
                Protocol::Smtp
            }
            Field::HttpMethod | Field::HttpPath | Field::HttpBody | Field::HttpHeader(_) => {
                Protocol::Http
            }
        }
    }

    /// Values of this field in a probe; several for multi-valued fields
    fn values<'a>(&self, probe: &'a Probe) -> Vec<&'a str> {
        match (self, probe) {
            (Field::DnsQtype, Probe::Dns(q)) => vec![q.qtype.as_str()],
            (Field::DnsName, Probe::Dns(q)) => vec![q.name.as_str()],
            (Field::SmtpMailFrom, Probe::Smtp(s)) => vec![s.mail_from.as_str()],
            (Field::SmtpRcptTo, Probe::Smtp(s)) => s.rcpt_tos.iter().map(String::as_str).collect(),
            (Field::SmtpData | Field::SmtpDataContains, Probe::Smtp(s)) => vec![s.data.as_str()],
            (Field::HttpMethod, Probe::Http(h)) => vec![h.method.as_str()],
            (Field::HttpPath, Probe::Http(h)) => vec![h.path.as_str()],
            (Field::HttpBody, Probe::Http(h)) => vec![h.body.as_str()],
            (Field::HttpHeader(name), Probe::Http(h)) => h
                .headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::DnsQtype => write!(f, "dns.qtype"),
            Field::DnsName => write!(f, "dns.name"),
            Field::SmtpMailFrom => write!(f, "smtp.mail_from"),
            Field::SmtpRcptTo => write!(f, "smtp.rcpt_to"),
            Field::SmtpData => write!(f, "smtp.data"),
            Field::SmtpDataContains => write!(f, "smtp.data.contains"),
            Field::HttpMethod => write!(f, "http.method"),
            Field::HttpPath => write!(f, "http.path"),
            Field::HttpBody => write!(f, "http.body"),
            Field::HttpHeader(name) => write!(f, "http.header.{name}"),
        }
    }
}

/// How a predicate compares a field value
#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    fn parse(value: &str) -> Result<Self> {
        match value.strip_prefix(PATTERN_PREFIX) {
            Some(pattern) => {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .dot_matches_new_line(true)
                    .size_limit(PATTERN_SIZE_LIMIT)
                    .build()?;
                Ok(Matcher::Pattern(regex))
            }
            None => Ok(Matcher::Exact(value.to_string())),
        }
    }
}

/// A condition on one probe field
#[derive(Debug, Clone)]
pub struct Predicate {
    pub field: Field,
    pub matcher: Matcher,
    raw: String,
}

impl Predicate {
    pub fn matches(&self, probe: &Probe) -> bool {
        self.field
            .values(probe)
            .into_iter()
            .any(|value| self.matches_value(value))
    }

    fn matches_value(&self, value: &str) -> bool {
        match &self.matcher {
            Matcher::Pattern(regex) => regex.is_match(value),
            Matcher::Exact(expected) => match self.field {
                Field::DnsQtype | Field::HttpMethod => value.eq_ignore_ascii_case(expected),
                Field::DnsName => normalize_name(value) == normalize_name(expected),
                Field::SmtpDataContains => value.contains(expected.as_str()),
                _ => value == expected,
            },
        }
    }
}

/// A response transformation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    DnsAnswer(String),
    DnsTtl(u32),
    DnsRcode(Rcode),
    SmtpCode(u16),
    SmtpMessage(String),
    HttpStatus(u16),
    HttpBody(String),
    HttpHeader(String, String),
}

impl Action {
    fn parse(kind: &str, value: &str) -> Result<Self> {
        let action = match kind.trim().to_ascii_lowercase().as_str() {
            "dns.answer" => Action::DnsAnswer(non_empty(kind, value)?.to_string()),
            "dns.ttl" => Action::DnsTtl(parse_number(kind, value)?),
            "dns.rcode" => Action::DnsRcode(value.parse()?),
            "smtp.response.code" | "smtp.code" => {
                Action::SmtpCode(parse_code(kind, value, 200..=599)?)
            }
            "smtp.response.message" | "smtp.message" => {
                Action::SmtpMessage(single_line(kind, value)?.to_string())
            }
            "http.status" | "http.code" => Action::HttpStatus(parse_code(kind, value, 200..=599)?),
            "http.body" => Action::HttpBody(value.to_string()),
            "http.header" => {
                let (name, header_value) = value.split_once(':').ok_or_else(|| {
                    VigilError::MalformedInput(format!("{kind} expects 'Name: value'"))
                })?;
                let name = name.trim();
                if name.is_empty()
                    || !name
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
                {
                    return Err(VigilError::MalformedInput(format!(
                        "invalid header name '{name}'"
                    )));
                }
                Action::HttpHeader(
                    name.to_string(),
                    single_line(kind, header_value.trim())?.to_string(),
                )
            }
            _ => {
                return Err(VigilError::MalformedInput(format!(
                    "unknown action '{kind}'"
                )))
            }
        };
        Ok(action)
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Action::DnsAnswer(_) | Action::DnsTtl(_) | Action::DnsRcode(_) => Protocol::Dns,
            Action::SmtpCode(_) | Action::SmtpMessage(_) => Protocol::Smtp,
            Action::HttpStatus(_) | Action::HttpBody(_) | Action::HttpHeader(..) => Protocol::Http,
        }
    }

    fn component(&self) -> RuleComponent {
        let (name, value) = match self {
            Action::DnsAnswer(v) => ("dns.answer", v.clone()),
            Action::DnsTtl(v) => ("dns.ttl", v.to_string()),
            Action::DnsRcode(v) => ("dns.rcode", v.to_string()),
            Action::SmtpCode(v) => ("smtp.response.code", v.to_string()),
            Action::SmtpMessage(v) => ("smtp.response.message", v.clone()),
            Action::HttpStatus(v) => ("http.status", v.to_string()),
            Action::HttpBody(v) => ("http.body", v.clone()),
            Action::HttpHeader(n, v) => ("http.header", format!("{n}: {v}")),
        };
        RuleComponent {
            actionname: name.to_string(),
            actionvalue: value,
            ispredicate: false,
        }
    }
}

fn non_empty<'a>(kind: &str, value: &'a str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(VigilError::MalformedInput(format!("{kind} needs a value")));
    }
    Ok(value.trim())
}

fn single_line<'a>(kind: &str, value: &'a str) -> Result<&'a str> {
    if value.contains(['\r', '\n']) {
        return Err(VigilError::MalformedInput(format!(
            "{kind} must not contain line breaks"
        )));
    }
    Ok(value)
}

fn parse_number<T: std::str::FromStr>(kind: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| VigilError::MalformedInput(format!("{kind} expects a number, got '{value}'")))
}

fn parse_code(kind: &str, value: &str, range: std::ops::RangeInclusive<u16>) -> Result<u16> {
    let code: u16 = parse_number(kind, value)?;
    if !range.contains(&code) {
        return Err(VigilError::MalformedInput(format!(
            "{kind} {code} outside {}..={}",
            range.start(),
            range.end()
        )));
    }
    Ok(code)
}

/// One element of a rule, in evaluation order
#[derive(Debug, Clone)]
pub enum Component {
    Predicate(Predicate),
    Action(Action),
}

/// A validated rule bound to a zone and protocol
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: Uuid,
    pub zone: String,
    pub name: String,
    pub protocol: Protocol,
    pub priority: i32,
    pub components: Vec<Component>,
}

impl Rule {
    /// Builds a rule from wire components
    ///
    /// Every component must belong to the rule's protocol; unknown fields,
    /// unknown actions and unparsable values are rejected.
    pub fn new(
        zone: &str,
        name: &str,
        protocol: Protocol,
        priority: i32,
        components: &[RuleComponent],
    ) -> Result<Self> {
        let mut parsed = Vec::with_capacity(components.len());
        for c in components {
            let component = if c.ispredicate {
                let field = Field::parse(&c.actionname)?;
                if field.protocol() != protocol {
                    return Err(VigilError::MalformedInput(format!(
                        "predicate {field} does not apply to {protocol} rules"
                    )));
                }
                Component::Predicate(Predicate {
                    field,
                    matcher: Matcher::parse(&c.actionvalue)?,
                    raw: c.actionvalue.clone(),
                })
            } else {
                let action = Action::parse(&c.actionname, &c.actionvalue)?;
                if action.protocol() != protocol {
                    return Err(VigilError::MalformedInput(format!(
                        "action {} does not apply to {protocol} rules",
                        c.actionname
                    )));
                }
                Component::Action(action)
            };
            parsed.push(component);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            zone: normalize_name(zone),
            name: name.to_string(),
            protocol,
            priority,
            components: parsed,
        })
    }

    pub fn predicates(&self) -> impl Iterator<Item = &Predicate> {
        self.components.iter().filter_map(|c| match c {
            Component::Predicate(p) => Some(p),
            Component::Action(_) => None,
        })
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.components.iter().filter_map(|c| match c {
            Component::Action(a) => Some(a),
            Component::Predicate(_) => None,
        })
    }

    /// True when the protocol agrees and every predicate holds
    pub fn matches(&self, probe: &Probe) -> bool {
        self.protocol == probe.protocol() && self.predicates().all(|p| p.matches(probe))
    }

    /// Components back in wire form, order preserved
    pub fn to_components(&self) -> Vec<RuleComponent> {
        self.components
            .iter()
            .map(|c| match c {
                Component::Predicate(p) => RuleComponent {
                    actionname: p.field.to_string(),
                    actionvalue: p.raw.clone(),
                    ispredicate: true,
                },
                Component::Action(a) => a.component(),
            })
            .collect()
    }
}

/// Rule as listed by the management API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleView {
    pub ruleid: Uuid,
    pub zone: String,
    pub name: String,
    pub networkprotocol: Protocol,
    pub priority: i32,
    pub rulecomponents: Vec<RuleComponent>,
}

impl From<&Rule> for RuleView {
    fn from(rule: &Rule) -> Self {
        Self {
            ruleid: rule.id,
            zone: rule.zone.clone(),
            name: rule.name.clone(),
            networkprotocol: rule.protocol,
            priority: rule.priority,
            rulecomponents: rule.to_components(),
        }
    }
}

impl TryFrom<&RuleView> for Rule {
    type Error = VigilError;

    /// Rebuilds a saved rule, keeping its id
    fn try_from(view: &RuleView) -> Result<Self> {
        let mut rule = Rule::new(
            &view.zone,
            &view.name,
            view.networkprotocol,
            view.priority,
            &view.rulecomponents,
        )?;
        rule.id = view.ruleid;
        Ok(rule)
    }
}

/// Actions of the winning rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseOverride {
    pub actions: Vec<Action>,
}

impl ResponseOverride {
    /// Applies the actions in order to a protocol default response
    ///
    /// The first `dns.answer` discards the default answers; later ones append.
    pub fn apply(&self, response: &mut ProbeResponse) {
        let mut answers_replaced = false;
        for action in &self.actions {
            match (action, &mut *response) {
                (Action::DnsAnswer(value), ProbeResponse::Dns(dns)) => {
                    if !answers_replaced {
                        dns.answers.clear();
                        answers_replaced = true;
                    }
                    dns.answers.push(value.clone());
                }
                (Action::DnsTtl(ttl), ProbeResponse::Dns(dns)) => dns.ttl = *ttl,
                (Action::DnsRcode(rcode), ProbeResponse::Dns(dns)) => dns.rcode = *rcode,
                (Action::SmtpCode(code), ProbeResponse::Smtp(smtp)) => smtp.code = *code,
                (Action::SmtpMessage(message), ProbeResponse::Smtp(smtp)) => {
                    smtp.message = message.clone()
                }
                (Action::HttpStatus(status), ProbeResponse::Http(http)) => http.status = *status,
                (Action::HttpBody(body), ProbeResponse::Http(http)) => http.body = body.clone(),
                (Action::HttpHeader(name, value), ProbeResponse::Http(http)) => {
                    http.headers.push((name.clone(), value.clone()))
                }
                (action, response) => debug!(
                    "Skipping {:?}: not applicable to {}",
                    action,
                    response.summary()
                ),
            }
        }
    }
}

/// Outcome of evaluating a zone's rules against a probe
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub response_override: Option<ResponseOverride>,
    pub matched: Option<MatchedRule>,
}

impl Evaluation {
    /// Applies the override, if any, to a default response
    pub fn apply(&self, response: &mut ProbeResponse) {
        if let Some(o) = &self.response_override {
            o.apply(response);
        }
    }
}

type RuleTable = HashMap<String, Arc<[Rule]>>;

/// Per-zone rule lists, swapped as immutable snapshots
pub struct RuleEngine {
    rules: ArcSwap<RuleTable>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Current rules of a zone in evaluation order
    pub fn rules_for(&self, zone: &str) -> Arc<[Rule]> {
        self.rules
            .load()
            .get(&normalize_name(zone))
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Adds a rule after every rule of equal or lower priority
    pub fn add_rule(&self, rule: Rule) {
        let zone = rule.zone.clone();
        info!("Adding rule '{}' ({}) to zone {}", rule.name, rule.id, zone);
        self.rules.rcu(|table| {
            let mut next = RuleTable::clone(table);
            let mut list: Vec<Rule> = next
                .get(&zone)
                .map(|r| r.to_vec())
                .unwrap_or_default();
            list.push(rule.clone());
            list.sort_by_key(|r| r.priority);
            next.insert(zone.clone(), Arc::from(list));
            next
        });
    }

    /// Removes a rule by id
    pub fn remove_rule(&self, zone: &str, id: Uuid) -> Result<()> {
        let zone = normalize_name(zone);
        if !self.rules_for(&zone).iter().any(|r| r.id == id) {
            return Err(VigilError::NotFound(format!("rule {id} in zone {zone}")));
        }
        self.rules.rcu(|table| {
            let mut next = RuleTable::clone(table);
            if let Some(list) = next.get(&zone) {
                let kept: Vec<Rule> = list.iter().filter(|r| r.id != id).cloned().collect();
                next.insert(zone.clone(), Arc::from(kept));
            }
            next
        });
        info!("Removed rule {} from zone {}", id, zone);
        Ok(())
    }

    /// Drops every rule of a zone
    pub fn clear_zone(&self, zone: &str) {
        let zone = normalize_name(zone);
        self.rules.rcu(|table| {
            let mut next = RuleTable::clone(table);
            next.remove(&zone);
            next
        });
    }

    /// Every rule, grouped by zone in evaluation order
    pub fn all_rules(&self) -> Vec<RuleView> {
        let table = self.rules.load();
        let mut zones: Vec<&String> = table.keys().collect();
        zones.sort();
        zones
            .into_iter()
            .flat_map(|zone| table[zone].iter().map(RuleView::from))
            .collect()
    }

    /// Replaces every rule with a saved list
    ///
    /// Nothing is replaced if any saved rule no longer validates.
    pub fn restore(&self, views: &[RuleView]) -> Result<()> {
        let mut table: HashMap<String, Vec<Rule>> = HashMap::new();
        for view in views {
            let rule = Rule::try_from(view)?;
            table.entry(rule.zone.clone()).or_default().push(rule);
        }
        let next: RuleTable = table
            .into_iter()
            .map(|(zone, mut list)| {
                list.sort_by_key(|r| r.priority);
                (zone, Arc::from(list))
            })
            .collect();
        self.rules.store(Arc::new(next));
        Ok(())
    }

    /// Picks the first rule of the zone that matches the probe
    pub fn evaluate(&self, zone: &str, probe: &Probe) -> Evaluation {
        let rules = self.rules_for(zone);
        evaluate_rules(&rules, probe)
    }
}

/// First-match evaluation over an ordered rule list
pub fn evaluate_rules(rules: &[Rule], probe: &Probe) -> Evaluation {
    match rules.iter().find(|r| r.matches(probe)) {
        Some(rule) => {
            debug!("Rule '{}' matched {}", rule.name, probe.summary());
            Evaluation {
                response_override: Some(ResponseOverride {
                    actions: rule.actions().cloned().collect(),
                }),
                matched: Some(MatchedRule {
                    id: rule.id,
                    name: rule.name.clone(),
                }),
            }
        }
        None => Evaluation::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicate(name: &str, value: &str) -> RuleComponent {
        RuleComponent {
            actionname: name.to_string(),
            actionvalue: value.to_string(),
            ispredicate: true,
        }
    }

    #[test]
    fn test_header_field_parse() {
        assert_eq!(
            Field::parse("http.header.User-Agent").unwrap(),
            Field::HttpHeader("user-agent".to_string())
        );
        assert!(Field::parse("http.header.").is_err());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = Rule::new("z.ssrf.uk", "bad", Protocol::Http, 0, &[predicate("http.path", "~(")]);
        assert!(matches!(err, Err(VigilError::RegexError(_))));
    }

    #[test]
    fn test_restore_keeps_ids_and_order() {
        let engine = RuleEngine::new();
        let late = Rule::new("z.ssrf.uk", "late", Protocol::Dns, 5, &[predicate("dns.qtype", "A")])
            .unwrap();
        let early = Rule::new("z.ssrf.uk", "early", Protocol::Dns, 1, &[predicate("dns.qtype", "A")])
            .unwrap();
        let (late_id, early_id) = (late.id, early.id);
        engine.add_rule(late);
        engine.add_rule(early);

        let restored = RuleEngine::new();
        restored.restore(&engine.all_rules()).unwrap();
        let ids: Vec<Uuid> = restored.rules_for("z.ssrf.uk").iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early_id, late_id]);
    }

    #[test]
    fn test_http_status_must_be_final() {
        for code in ["101", "199", "600"] {
            let err = Action::parse("http.status", code);
            assert!(matches!(err, Err(VigilError::MalformedInput(_))), "{code} accepted");
        }
        assert!(matches!(Action::parse("http.status", "200"), Ok(Action::HttpStatus(200))));
        assert!(matches!(Action::parse("http.code", "599"), Ok(Action::HttpStatus(599))));
    }

    #[test]
    fn test_components_roundtrip_in_order() {
        let components = vec![
            predicate("dns.type", "TXT"),
            RuleComponent {
                actionname: "dns.answer".to_string(),
                actionvalue: "verified".to_string(),
                ispredicate: false,
            },
        ];
        let rule = Rule::new("z.ssrf.uk", "txt", Protocol::Dns, 0, &components).unwrap();
        let back = rule.to_components();
        assert_eq!(back[0].actionname, "dns.qtype");
        assert_eq!(back[0].actionvalue, "TXT");
        assert_eq!(back[1], components[1]);
    }
}
