// Google Sheets values API client

pub mod auth;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use self::auth::{ServiceAccountKey, TokenProvider};
use crate::settings::SheetsSettings;

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid service account credentials: {0}")]
    Credentials(String),
    #[error("token exchange failed: {0}")]
    Auth(String),
    #[error("sheets api error: status={status} body={body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    // absent when the range is empty
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct ValueUpdate<'a> {
    range: &'a str,
    #[serde(rename = "majorDimension")]
    major_dimension: &'static str,
    values: [[i64; 1]; 1],
}

pub struct SheetsClient {
    http: Client,
    tokens: TokenProvider,
    spreadsheet_id: String,
    base_url: String,
}

impl SheetsClient {
    pub fn new(cfg: &SheetsSettings, key: ServiceAccountKey) -> Result<Self, SheetsError> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| SheetsError::Http(e.to_string()))?;
        let tokens = TokenProvider::new(http.clone(), key)?;

        Ok(Self {
            http,
            tokens,
            spreadsheet_id: cfg.spreadsheet_id.clone(),
            base_url: SHEETS_API_BASE.to_string(),
        })
    }

    fn values_url(&self, range: &str) -> Result<Url, SheetsError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| SheetsError::Http(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| SheetsError::Http(format!("cannot-be-a-base url: {}", self.base_url)))?
            .push(&self.spreadsheet_id)
            .push("values")
            .push(range);
        Ok(url)
    }

    async fn check(resp: reqwest::Response) -> Result<String, SheetsError> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| SheetsError::Decode(e.to_string()))?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(SheetsError::Api {
                status: status.as_u16(),
                body: text,
            })
        }
    }

    // GET /v4/spreadsheets/{id}/values/{range}
    /// Reads a range as rows of cell strings. Trailing empty cells are not returned.
    #[instrument(skip(self), fields(method = "GET", range = %range))]
    pub async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, SheetsError> {
        let token = self.tokens.access_token().await?;
        info!(target: "sheets", method = "GET", range = %range, "sheets request");

        let resp = self
            .http
            .get(self.values_url(range)?)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SheetsError::Http(e.to_string()))?;
        let text = Self::check(resp).await?;
        let body: ValueRange =
            serde_json::from_str(&text).map_err(|e| SheetsError::Decode(e.to_string()))?;

        Ok(body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect())
    }

    // PUT /v4/spreadsheets/{id}/values/{range}?valueInputOption=RAW
    #[instrument(skip(self), fields(method = "PUT", range = %range, value = value))]
    pub async fn update_cell(&self, range: &str, value: i64) -> Result<(), SheetsError> {
        let token = self.tokens.access_token().await?;
        info!(target: "sheets", method = "PUT", range = %range, value = value, "sheets request");

        let body = ValueUpdate {
            range,
            major_dimension: "ROWS",
            values: [[value]],
        };
        let resp = self
            .http
            .put(self.values_url(range)?)
            .query(&[("valueInputOption", "RAW")])
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SheetsError::Http(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }
}

/// The values operations the inventory gateway is built on.
#[async_trait]
pub trait ValuesApi: Send + Sync {
    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, SheetsError>;
    async fn update_cell(&self, range: &str, value: i64) -> Result<(), SheetsError>;
}

#[async_trait]
impl ValuesApi for SheetsClient {
    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, SheetsError> {
        SheetsClient::get_values(self, range).await
    }

    async fn update_cell(&self, range: &str, value: i64) -> Result<(), SheetsError> {
        SheetsClient::update_cell(self, range, value).await
    }
}

fn cell_to_string(cell: serde_json::Value) -> String {
    match cell {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_range_tolerates_missing_values() {
        let body: ValueRange = serde_json::from_str(r#"{"range":"Stock!A2:E1000","majorDimension":"ROWS"}"#).unwrap();
        assert!(body.values.is_empty());
    }

    #[test]
    fn test_cells_render_as_strings() {
        assert_eq!(cell_to_string(serde_json::json!("A1")), "A1");
        assert_eq!(cell_to_string(serde_json::json!(5)), "5");
        assert_eq!(cell_to_string(serde_json::Value::Null), "");
    }

    #[test]
    fn test_update_body_shape() {
        let body = ValueUpdate {
            range: "Stock!E4",
            major_dimension: "ROWS",
            values: [[3]],
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"range": "Stock!E4", "majorDimension": "ROWS", "values": [[3]]})
        );
    }
}
