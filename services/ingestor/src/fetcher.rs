//! Upstream fetcher (C2): one reusable HTTP client, one JSONP-stripping
//! parse, DTO -> mid-price conversion. Grounded on the original
//! `EmcontService.fetch_exchange_rates_data`/`_extract_rates`: the upstream
//! endpoint wraps its JSON body in a `null(...)` JSONP callback shell that
//! has to be peeled off by regex before the rest is plain JSON.

use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use crate::error::FetchError;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(2_500);
const TOTAL_TIMEOUT: Duration = Duration::from_millis(2_500);

/// `null(<content>);`, content captured non-greedily is wrong here — the
/// payload itself may contain literal `);` sequences inside strings, so the
/// capture is greedy and anchored at both ends of the body instead.
static ENVELOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\Anull\((?P<content>.*)\);\s*\z").expect("valid regex"));

/// One upstream rate quote. Unknown fields (`Spread`, `ProductType`, the
/// 52-week high/low, ...) are tolerated by simply not being named here;
/// serde ignores them by default.
#[derive(Debug, Clone, Deserialize)]
pub struct RateDto {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Bid")]
    pub bid: f64,
    #[serde(rename = "Ask")]
    pub ask: f64,
}

impl RateDto {
    /// The mid-price: the arithmetic mean of bid and ask.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Build the process-wide HTTP client. Constructed once and cloned into
/// every worker; `reqwest::Client` is an `Arc` internally, so clones share
/// the same connection pool and keep-alive sockets.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(TOTAL_TIMEOUT)
        .build()
        .expect("reqwest client configuration is valid")
}

/// Fetch and parse the upstream rate list.
pub async fn fetch_rates(client: &reqwest::Client, url: &str) -> Result<Vec<RateDto>, FetchError> {
    let response = client.get(url).send().await.map_err(classify)?;
    let body = response.text().await.map_err(classify)?;
    extract_rates(&body)
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Http(err)
    }
}

fn extract_rates(body: &str) -> Result<Vec<RateDto>, FetchError> {
    let captures = ENVELOPE
        .captures(body)
        .ok_or_else(|| FetchError::Format("response did not match the JSONP envelope".to_owned()))?;
    let content = &captures["content"];

    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| FetchError::Format(format!("invalid JSON in envelope: {e}")))?;

    let rates = value
        .get("Rates")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| FetchError::Format("\"Rates\" field missing or not an array".to_owned()))?;

    serde_json::from_value(serde_json::Value::Array(rates.clone()))
        .map_err(|e| FetchError::Format(format!("invalid rate entry: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rates_from_a_well_formed_envelope() {
        let body = r#"null({"Rates":[{"Symbol":"EURUSD","Bid":1.1,"Ask":1.2,"Spread":0.1}]});"#;
        let rates = extract_rates(body).unwrap();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].symbol, "EURUSD");
        assert_eq!(rates[0].mid(), 1.15);
    }

    #[test]
    fn tolerates_unknown_fields_on_each_entry() {
        let body = r#"null({"Rates":[{"Symbol":"GBPUSD","Bid":1.0,"Ask":1.0,"ProductType":"fx","52WeekHigh":1.5}]});"#;
        let rates = extract_rates(body).unwrap();
        assert_eq!(rates[0].symbol, "GBPUSD");
    }

    #[test]
    fn rejects_a_body_without_the_jsonp_wrapper() {
        let err = extract_rates(r#"{"Rates":[]}"#).unwrap_err();
        assert!(matches!(err, FetchError::Format(_)));
    }

    #[test]
    fn rejects_malformed_json_inside_the_wrapper() {
        let err = extract_rates("null(not json);").unwrap_err();
        assert!(matches!(err, FetchError::Format(_)));
    }

    #[test]
    fn rejects_a_missing_rates_field() {
        let err = extract_rates(r#"null({"Other":[]});"#).unwrap_err();
        assert!(matches!(err, FetchError::Format(_)));
    }

    #[test]
    fn rejects_a_non_array_rates_field() {
        let err = extract_rates(r#"null({"Rates":"not-an-array"});"#).unwrap_err();
        assert!(matches!(err, FetchError::Format(_)));
    }

    #[test]
    fn envelope_content_may_contain_embedded_parens_and_semicolons() {
        let body = r#"null({"Rates":[{"Symbol":"EURUSD","Bid":1.0,"Ask":1.0,"Note":"a (nested); value"}]});"#;
        let rates = extract_rates(body).unwrap();
        assert_eq!(rates.len(), 1);
    }
}
