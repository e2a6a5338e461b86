//! Field extraction from register search responses.
//!
//! The upstream feed is inconsistent about namespace prefixes, so values are
//! located by local element name with any (or no) prefix. Lookups are scoped
//! to their enclosing block: a `FilingDate` only counts inside
//! `ApplicationIdentification`, owner names only inside their `Owner`, and
//! so on.

use crate::request::unescape_xml;
use crate::types::RegistryRecord;
use regex::Regex;
use std::sync::LazyLock;

/// Matches a whole element and captures its content.
fn element(name: &str) -> Regex {
    Regex::new(&format!(
        r"(?is)<(?:\w+:)?{name}\b[^>]*>(.*?)</(?:\w+:)?{name}\s*>"
    ))
    .expect("element pattern is valid")
}

static STATUS_EVENT: LazyLock<Regex> = LazyLock::new(|| element("StatusEventData"));
static EVENT_DATE: LazyLock<Regex> = LazyLock::new(|| element("EventDate"));
static KEY_EVENT_CODE: LazyLock<Regex> = LazyLock::new(|| element("KeyEventCode"));
static DETAILED_EVENT_CODE: LazyLock<Regex> = LazyLock::new(|| element("DetailedEventCode"));

static NOT_IN_FORCE_DATE: LazyLock<Regex> = LazyLock::new(|| element("NotInForceDate"));
static REASON_NOT_IN_FORCE: LazyLock<Regex> =
    LazyLock::new(|| element("ReasonNotInForceCategory"));

static PRACTITIONER: LazyLock<Regex> = LazyLock::new(|| element("RegisteredPractitioner"));
static PERSON_FULL_NAME: LazyLock<Regex> = LazyLock::new(|| element("PersonFullName"));
static ORGANIZATION_NAME: LazyLock<Regex> = LazyLock::new(|| element("OrganizationNameText"));
static NAME_TEXT: LazyLock<Regex> = LazyLock::new(|| element("NameText"));

static APPLICATION_IDENTIFICATION: LazyLock<Regex> =
    LazyLock::new(|| element("ApplicationIdentification"));
static FILING_DATE: LazyLock<Regex> = LazyLock::new(|| element("FilingDate"));
static GRANT_IDENTIFICATION: LazyLock<Regex> =
    LazyLock::new(|| element("PatentGrantIdentification"));
static GRANT_DATE: LazyLock<Regex> = LazyLock::new(|| element("GrantDate"));

static OWNER: LazyLock<Regex> = LazyLock::new(|| element("Owner"));
static ADDRESS_LINE: LazyLock<Regex> = LazyLock::new(|| element("AddressLineText"));
static COUNTRY_CODE: LazyLock<Regex> = LazyLock::new(|| element("CountryCode"));

const NOT_IN_FORCE_PREFIX: &str = "Not in force: ";
const UNKNOWN_REASON: &str = "Unknown reason";

#[derive(Debug, Default, PartialEq)]
struct StatusEvent {
    date: String,
    key: String,
    detail: String,
}

impl StatusEvent {
    fn code(&self) -> String {
        match (self.key.is_empty(), self.detail.is_empty()) {
            (false, false) => format!("{}/{}", self.key, self.detail),
            (false, true) => self.key.clone(),
            (true, _) => self.detail.clone(),
        }
    }
}

/// Trimmed, entity-decoded content of the first match of `re` in `haystack`.
fn first(re: &Regex, haystack: &str) -> String {
    re.captures(haystack)
        .map(|cap| unescape_xml(cap[1].trim()))
        .unwrap_or_default()
}

/// Content of every block matched by `re`.
fn blocks<'a>(re: &Regex, haystack: &'a str) -> Vec<&'a str> {
    re.captures_iter(haystack)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect()
}

/// First non-empty `child` value found inside any block matched by `parent`.
fn scoped(parent: &Regex, child: &Regex, xml: &str) -> String {
    blocks(parent, xml)
        .into_iter()
        .map(|block| first(child, block))
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

/// Person name, else organization name, else any name text.
fn party_name(block: &str) -> String {
    [&*PERSON_FULL_NAME, &*ORGANIZATION_NAME, &*NAME_TEXT]
        .into_iter()
        .map(|re| first(re, block))
        .find(|name| !name.is_empty())
        .unwrap_or_default()
}

fn status_events(xml: &str) -> Vec<StatusEvent> {
    blocks(&STATUS_EVENT, xml)
        .into_iter()
        .map(|block| StatusEvent {
            date: first(&EVENT_DATE, block),
            key: first(&KEY_EVENT_CODE, block),
            detail: first(&DETAILED_EVENT_CODE, block),
        })
        .filter(|event| {
            !event.date.is_empty() || !event.key.is_empty() || !event.detail.is_empty()
        })
        .collect()
}

/// Most recent status event. Dates are compared as strings, which assumes the
/// register always emits fixed-width ISO dates. Events on the same date keep
/// document order.
fn current_status(xml: &str) -> StatusEvent {
    let mut events = status_events(xml);
    events.sort_by(|a, b| b.date.cmp(&a.date));
    events.into_iter().next().unwrap_or_default()
}

fn representative(xml: &str) -> String {
    let practitioners = blocks(&PRACTITIONER, xml);
    [&*PERSON_FULL_NAME, &*ORGANIZATION_NAME, &*NAME_TEXT]
        .into_iter()
        .flat_map(|re| practitioners.iter().map(move |block| first(re, block)))
        .find(|name| !name.is_empty())
        .unwrap_or_default()
}

fn owner_address(block: &str) -> String {
    let mut parts: Vec<String> = ADDRESS_LINE
        .captures_iter(block)
        .map(|cap| unescape_xml(cap[1].trim()))
        .filter(|line| !line.is_empty())
        .collect();

    let country = first(&COUNTRY_CODE, block);
    if !country.is_empty() {
        parts.push(country);
    }
    parts.join(", ")
}

/// Extracts the register record from a raw search response.
pub fn extract_fields(xml: &str) -> RegistryRecord {
    let current = current_status(xml);
    let mut status_code = current.code();
    let mut last_change_date = current.date;

    let not_in_force_date = first(&NOT_IN_FORCE_DATE, xml);
    let not_in_force_reason = first(&REASON_NOT_IN_FORCE, xml);
    if !not_in_force_date.is_empty() || !not_in_force_reason.is_empty() {
        let reason = if not_in_force_reason.is_empty() {
            UNKNOWN_REASON
        } else {
            not_in_force_reason.as_str()
        };
        status_code = format!("{NOT_IN_FORCE_PREFIX}{reason}");
        if !not_in_force_date.is_empty() {
            last_change_date = not_in_force_date;
        }
    }

    let (owner_names, owner_addresses): (Vec<String>, Vec<String>) = blocks(&OWNER, xml)
        .into_iter()
        .map(|block| (party_name(block), owner_address(block)))
        .filter(|(name, address)| !name.is_empty() || !address.is_empty())
        .unzip();

    RegistryRecord {
        status_code,
        last_change_date,
        representative: representative(xml),
        filing_date: scoped(&APPLICATION_IDENTIFICATION, &FILING_DATE, xml),
        grant_date: scoped(&GRANT_IDENTIFICATION, &GRANT_DATE, xml),
        owner_names,
        owner_addresses,
    }
}
