use harvester_core::QueryMap;
use harvester_engine::{ExtractionError, FieldExtractor, HtmlFieldExtractor, QueryDialect};
use pretty_assertions::assert_eq;

const PAGE: &str = r#"<!doctype html>
<html>
  <head><title>Shop</title></head>
  <body>
    <h1> Widgets </h1>
    <ul id="items">
      <li class="item"><a href="/w1">Small widget</a> <span class="price">3</span></li>
      <li class="item sale"><a href="/w2">Large widget</a> <span class="price">9</span></li>
      <li class="item"><a href="/w3"><b>Huge</b> widget</a></li>
    </ul>
  </body>
</html>"#;

fn extract(dialect: QueryDialect, queries: &[(&str, &str)]) -> Result<Vec<(String, Vec<String>)>, ExtractionError> {
    let queries: QueryMap = queries.iter().copied().collect();
    HtmlFieldExtractor::new(dialect)
        .extract(PAGE.as_bytes(), Some("text/html; charset=utf-8"), &queries)
        .map(|record| record.into_iter().collect())
}

fn values(list: &[&str]) -> Vec<String> {
    list.iter().map(|value| value.to_string()).collect()
}

#[test]
fn xpath_fields_collect_every_match_in_document_order() {
    let record = extract(
        QueryDialect::XPath,
        &[
            ("title", "//h1"),
            ("links", "//li/a/@href"),
            ("names", "//li[@class='item']/a"),
            ("sale", "//li[contains(@class, 'sale')]/span/text()"),
        ],
    )
    .unwrap();

    assert_eq!(
        record,
        vec![
            ("links".to_string(), values(&["/w1", "/w2", "/w3"])),
            ("names".to_string(), values(&["Small widget", "Huge widget"])),
            ("sale".to_string(), values(&["9"])),
            ("title".to_string(), values(&[" Widgets "])),
        ]
    );
}

#[test]
fn element_text_is_not_trimmed_in_either_dialect() {
    for (dialect, expression) in [(QueryDialect::XPath, "//h1"), (QueryDialect::Css, "h1")] {
        let record = extract(dialect, &[("title", expression)]).unwrap();
        assert_eq!(record, vec![("title".to_string(), values(&[" Widgets "]))]);
    }
}

#[test]
fn common_xpath_functions_and_axes_are_available() {
    let record = extract(
        QueryDialect::XPath,
        &[
            ("second_last", "//li[last() - 1]/a"),
            ("odd", "//li[position() mod 2 = 1]/a/@href"),
            ("total", "sum(//span[@class='price'])"),
            ("after", "//li[1]/following::a/@href"),
            ("slug", "substring-after(//li[2]/a/@href, '/')"),
        ],
    )
    .unwrap();

    assert_eq!(
        record,
        vec![
            ("after".to_string(), values(&["/w2", "/w3"])),
            ("odd".to_string(), values(&["/w1", "/w3"])),
            ("second_last".to_string(), values(&["Large widget"])),
            ("slug".to_string(), values(&["w2"])),
            ("total".to_string(), values(&["12"])),
        ]
    );
}

#[test]
fn no_match_is_an_empty_list_not_an_error() {
    let record = extract(QueryDialect::XPath, &[("missing", "//table/tr")]).unwrap();
    assert_eq!(record, vec![("missing".to_string(), Vec::new())]);
}

#[test]
fn one_invalid_expression_fails_the_whole_record() {
    let err = extract(QueryDialect::XPath, &[("ok", "//h1"), ("bad", "//li[")]).unwrap_err();
    assert!(matches!(
        err,
        ExtractionError::InvalidExpression { ref field, .. } if field == "bad"
    ));
}

#[test]
fn css_dialect_uses_selectors() {
    let record = extract(
        QueryDialect::Css,
        &[("prices", "li.item span.price"), ("first", "#items > li:first-child a")],
    )
    .unwrap();

    assert_eq!(
        record,
        vec![
            ("first".to_string(), values(&["Small widget"])),
            ("prices".to_string(), values(&["3", "9"])),
        ]
    );
}

#[test]
fn invalid_selector_is_reported() {
    let err = extract(QueryDialect::Css, &[("bad", "li[")]).unwrap_err();
    assert!(matches!(err, ExtractionError::InvalidExpression { .. }));
}

#[test]
fn extraction_is_deterministic() {
    let queries = [("names", "//a"), ("count", "count(//li)")];
    let first = extract(QueryDialect::XPath, &queries).unwrap();
    let second = extract(QueryDialect::XPath, &queries).unwrap();
    assert_eq!(first, second);
    assert_eq!(first[0], ("count".to_string(), values(&["3"])));
}

#[test]
fn undecodable_body_is_a_decode_error() {
    let queries: QueryMap = [("t", "//h1")].into_iter().collect();
    let err = HtmlFieldExtractor::default()
        .extract(b"<h1>\xff\xfe</h1>", Some("text/html; charset=utf-8"), &queries)
        .unwrap_err();
    assert!(matches!(err, ExtractionError::Decode(_)));
}
