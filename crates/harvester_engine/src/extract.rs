use harvester_core::{QueryMap, ResultRecord};
use scraper::{Html, Selector};

use crate::decode::{decode_body, DecodeError};
use crate::xpath::{Evaluator, PathExpression};

/// Which language the query expressions are written in.
///
/// Both dialects yield an element's full text content with its whitespace intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryDialect {
    /// XPath 1.0 subset path expressions.
    #[default]
    XPath,
    /// CSS selectors.
    Css,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("field `{field}`: invalid expression `{expression}`: {message}")]
    InvalidExpression {
        field: String,
        expression: String,
        message: String,
    },
    #[error("field `{field}`: {message}")]
    Evaluation { field: String, message: String },
    #[error("undecodable body: {0}")]
    Decode(#[from] DecodeError),
}

/// Evaluates every query of a [`QueryMap`] against one document body.
///
/// All fields must succeed: the first failing field fails the whole record.
pub trait FieldExtractor: Send + Sync {
    fn extract(
        &self,
        body: &[u8],
        content_type: Option<&str>,
        queries: &QueryMap,
    ) -> Result<ResultRecord, ExtractionError>;
}

/// Lenient HTML parsing via `scraper`; malformed markup never fails the parse.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlFieldExtractor {
    dialect: QueryDialect,
}

impl HtmlFieldExtractor {
    pub fn new(dialect: QueryDialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> QueryDialect {
        self.dialect
    }
}

impl FieldExtractor for HtmlFieldExtractor {
    fn extract(
        &self,
        body: &[u8],
        content_type: Option<&str>,
        queries: &QueryMap,
    ) -> Result<ResultRecord, ExtractionError> {
        let text = decode_body(body, content_type)?;
        let document = Html::parse_document(&text);
        match self.dialect {
            QueryDialect::XPath => extract_xpath(&document, queries),
            QueryDialect::Css => extract_css(&document, queries),
        }
    }
}

fn extract_xpath(document: &Html, queries: &QueryMap) -> Result<ResultRecord, ExtractionError> {
    let evaluator = Evaluator::new(document);
    let mut record = ResultRecord::new();
    for (field, expression) in queries.iter() {
        let parsed =
            PathExpression::parse(expression).map_err(|err| ExtractionError::InvalidExpression {
                field: field.to_string(),
                expression: expression.to_string(),
                message: err.to_string(),
            })?;
        let values = parsed
            .select_text(&evaluator)
            .map_err(|err| ExtractionError::Evaluation {
                field: field.to_string(),
                message: err.to_string(),
            })?;
        record.insert(field.to_string(), values);
    }
    Ok(record)
}

fn extract_css(document: &Html, queries: &QueryMap) -> Result<ResultRecord, ExtractionError> {
    let mut record = ResultRecord::new();
    for (field, expression) in queries.iter() {
        let selector =
            Selector::parse(expression).map_err(|err| ExtractionError::InvalidExpression {
                field: field.to_string(),
                expression: expression.to_string(),
                message: err.to_string(),
            })?;
        let values = document
            .select(&selector)
            .map(|node| node.text().collect::<String>())
            .collect();
        record.insert(field.to_string(), values);
    }
    Ok(record)
}
