//! Search request envelope and identifier matching for register responses.

use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

const CORE_NS: &str = "urn:ige:schema:xsd:datadeliverycore-1.0.0";
const PATENT_NS: &str = "urn:ige:schema:xsd:datadeliverypatent-1.0.0";
const COMMON_NS: &str = "urn:ige:schema:xsd:datadeliverycommon-1.0.0";

static PUBLICATION_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)<(?:\w+:)?(?:PublicationNumber|PatentNumber)\b[^>]*>([^<]*)</(?:\w+:)?(?:PublicationNumber|PatentNumber)\s*>",
    )
    .expect("publication number pattern is valid")
});

/// Trims and upper-cases a raw identifier from the spreadsheet.
pub fn normalize_query(identifier: &str) -> String {
    identifier.trim().to_uppercase()
}

/// Comparison form of an identifier: no whitespace at all, upper-cased.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Decodes the predefined XML entities in extracted text.
pub fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Builds the free-text patent search envelope. Every call gets a fresh
/// correlation id.
pub fn build_request_xml(query: &str) -> String {
    build_request_xml_with_id(query, Uuid::new_v4())
}

fn build_request_xml_with_id(query: &str, request_id: Uuid) -> String {
    format!(
        concat!(
            "<?xml version='1.0' encoding='UTF-8'?>",
            r#"<ApiRequest uuid="{id}" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns="{core}" xmlns:pat="{patent}">"#,
            r#"<Action type="PatentSearch">"#,
            r#"<pat:PatentSearchRequest xmlns="{common}">"#,
            "<Query><Any>{query}</Any></Query>",
            "</pat:PatentSearchRequest></Action></ApiRequest>",
        ),
        id = request_id,
        core = CORE_NS,
        patent = PATENT_NS,
        common = COMMON_NS,
        query = escape_xml(query),
    )
}

/// Every publication or patent number in the response, normalized.
pub fn publication_numbers(xml: &str) -> Vec<String> {
    PUBLICATION_NUMBER
        .captures_iter(xml)
        .map(|cap| normalize_identifier(&cap[1]))
        .collect()
}

/// True when the response contains the exact identifier that was requested.
/// Free-text search may return neighbouring documents, so a 200 alone is not
/// enough.
pub fn contains_identifier(xml: &str, identifier: &str) -> bool {
    let wanted = normalize_identifier(identifier);
    publication_numbers(xml).iter().any(|found| *found == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope() {
        let id = Uuid::nil();
        let xml = build_request_xml_with_id("EP1234567", id);
        assert!(xml.starts_with("<?xml version='1.0' encoding='UTF-8'?><ApiRequest uuid=\"00000000-0000-0000-0000-000000000000\""));
        assert!(xml.contains(r#"<Action type="PatentSearch">"#));
        assert!(xml.contains("<Query><Any>EP1234567</Any></Query>"));
        assert!(xml.ends_with("</pat:PatentSearchRequest></Action></ApiRequest>"));
    }

    #[test]
    fn test_request_ids_differ() {
        let first = build_request_xml("EP1");
        let second = build_request_xml("EP1");
        assert_ne!(first, second);
    }

    #[test]
    fn test_query_is_escaped() {
        let xml = build_request_xml("EP<1>&'\"");
        assert!(xml.contains("<Any>EP&lt;1&gt;&amp;&apos;&quot;</Any>"));
        assert_eq!(unescape_xml("EP&lt;1&gt;&amp;&apos;&quot;"), "EP<1>&'\"");
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_query("  ep1234567 "), "EP1234567");
        assert_eq!(normalize_identifier(" ep 123 4567\n"), "EP1234567");
    }

    #[test]
    fn test_publication_numbers_any_prefix() {
        let xml = r#"
            <pat:PublicationNumber>EP 1234567</pat:PublicationNumber>
            <PatentNumber kind="B1">ep7654321</PatentNumber>
            <com:PublicationNumberBag>ignored</com:PublicationNumberBag>
        "#;
        assert_eq!(publication_numbers(xml), vec!["EP1234567", "EP7654321"]);
        assert!(contains_identifier(xml, "EP1234567"));
        assert!(!contains_identifier(xml, "EP1234568"));
    }
}
