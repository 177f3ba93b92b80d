use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use tokio::task::spawn_blocking;

use crate::record::ResultRecord;
use crate::{Error, Result};

pub const PASSED_PHRASE: &str = "CONGRATULATIONS, PASSED THE FINAL EXAM";
pub const FAILED_PHRASE: &str = "SORRY! YOU ARE NOT QUALIFIED!";

/// Redundant with the roll the record is keyed by.
const ROLL_DETAIL_KEY: &str = "Roll";

/// Parses the result page off the runtime threads.
/// `Html` isn't `Send`, so the whole document lives inside the blocking task.
pub async fn extract(roll: String, html: String) -> Result<ResultRecord> {
    spawn_blocking(move || extract_document(&roll, &html)).await?
}

/// Turns a result page into a record.
///
/// The page carries a single `span.red12bold` status marker. On a PASSED page
/// its parent cell holds `span.black12bold` siblings (the 2nd is the position,
/// the 3rd the subject) and loose `Key: Value` text lines with personal details.
/// Anything that is neither a PASSED nor a FAILED page is an
/// [`Error::Extraction`].
pub fn extract_document(roll: &str, html: &str) -> Result<ResultRecord> {
    let doc = Html::parse_document(html);
    let marker_selector = create_selector(r#"span[class="red12bold"]"#)?;

    let Some(marker) = doc.select(&marker_selector).next() else {
        return Err(extraction_error(roll, "status marker is missing"));
    };
    let status = marker.text().next().map(str::trim).unwrap_or_default();

    match status {
        PASSED_PHRASE => extract_passed(roll, marker),
        FAILED_PHRASE => Ok(ResultRecord::failed(roll)),
        other => Err(extraction_error(
            roll,
            format!("unrecognized status marker: {other:?}"),
        )),
    }
}

fn extract_passed(roll: &str, marker: ElementRef<'_>) -> Result<ResultRecord> {
    let cell = marker
        .parent()
        .and_then(ElementRef::wrap)
        .ok_or_else(|| extraction_error(roll, "status marker has no parent cell"))?;

    let bold_spans: Vec<ElementRef<'_>> = cell
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|el| {
            el.value().name() == "span" && el.value().attr("class") == Some("black12bold")
        })
        .collect();

    let position = bold_spans
        .get(1)
        .and_then(|span| first_text(*span))
        .ok_or_else(|| extraction_error(roll, "position is missing"))?;
    let subject = bold_spans
        .get(2)
        .and_then(|span| first_text(*span))
        .ok_or_else(|| extraction_error(roll, "subject is missing"))?;

    let lines = cell
        .children()
        .filter_map(|node| node.value().as_text().map(|text| &**text));
    let details = parse_details(lines);

    Ok(ResultRecord::passed(roll, position, subject, details))
}

/// Collects `Key: Value` lines. Lines without a colon are skipped, the roll line is dropped.
fn parse_details<'a>(lines: impl Iterator<Item = &'a str>) -> BTreeMap<String, String> {
    lines
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, _)| *key != ROLL_DETAIL_KEY)
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn first_text(el: ElementRef<'_>) -> Option<String> {
    el.text().next().map(|text| text.trim().to_string())
}

fn extraction_error(roll: &str, reason: impl Into<String>) -> Error {
    Error::Extraction {
        roll: roll.to_string(),
        reason: reason.into(),
    }
}

#[inline]
fn create_selector(sel_str: &str) -> Result<Selector> {
    Selector::parse(sel_str).map_err(|_| Error::ParseMissingSelector(sel_str.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Outcome;

    fn passed_page() -> String {
        format!(
            r#"<html><body><table><tr>
            <td>
                <span class="red12bold">{PASSED_PHRASE}</span><br>
                <span class="black12bold">Position:</span>
                <span class="black12bold"> 1st </span><br>
                <span class="black12bold">  Physics</span><br>
                Name: Jane Doe<br>
                Roll: 123456789<br>
                Father's Name :  John Doe <br>
                no colon here<br>
            </td>
            </tr></table></body></html>"#
        )
    }

    #[test]
    fn passed_page_yields_all_fields() {
        let record = extract_document("123456789", &passed_page()).unwrap();
        assert_eq!(record.status, Outcome::Passed);
        assert_eq!(record.position.as_deref(), Some("1st"));
        assert_eq!(record.subject.as_deref(), Some("Physics"));

        let mut expected = BTreeMap::new();
        expected.insert("Name".to_string(), "Jane Doe".to_string());
        expected.insert("Father's Name".to_string(), "John Doe".to_string());
        assert_eq!(record.personal_details, expected);
    }

    #[test]
    fn not_qualified_page_is_failed() {
        let html = format!(
            r#"<table><tr><td><span class="red12bold">{FAILED_PHRASE}</span></td></tr></table>"#
        );
        let record = extract_document("42", &html).unwrap();
        assert_eq!(record, ResultRecord::failed("42"));
    }

    #[test]
    fn unknown_pages_are_extraction_errors() {
        let missing = extract_document("1", "<html><body>Service busy</body></html>");
        assert!(matches!(missing, Err(Error::Extraction { .. })));

        let odd = r#"<table><tr><td><span class="red12bold">RESULT WITHHELD</span></td></tr></table>"#;
        let err = extract_document("1", odd).unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn passed_page_without_subject_is_an_error() {
        let html = format!(
            r#"<table><tr><td>
                <span class="red12bold">{PASSED_PHRASE}</span>
                <span class="black12bold">Position:</span>
                <span class="black12bold">1st</span>
            </td></tr></table>"#
        );
        assert!(matches!(
            extract_document("7", &html),
            Err(Error::Extraction { .. })
        ));
    }

    #[tokio::test]
    async fn extracts_on_a_blocking_thread() {
        let record = extract("123456789".into(), passed_page()).await.unwrap();
        assert_eq!(record.roll, "123456789");
        assert_eq!(record.status, Outcome::Passed);
    }
}
