//! Blocking HTTP client for the desktop data API.
//!
//! Every request is a `POST {base_url}/api/v1/data` carrying an entity name
//! and its arguments; the application key travels in the
//! `x-tr-applicationid` header. Chains and reference data use the data-grid
//! entity, time series the time-series entity.
//!
//! The client performs one request per call and never sleeps. Failures are
//! rendered into [`UpstreamError`]s whose messages keep the status or error
//! code, which is what the failure classifier reads.

use super::provider::{
    ChainRequest, DataRequest, MarketDataClient, Params, Payload, TimeseriesRequest,
    UpstreamError,
};
use crate::config::FetchConfig;
use crate::error::EngineError;
use crate::frame::{date_column, DATE_COLUMN};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const APP_KEY_HEADER: &str = "x-tr-applicationid";
const DATA_GRID_ENTITY: &str = "DataGrid_StandardAsync";
const TIMESERIES_ENTITY: &str = "TimeSeries";
const TIMESTAMP_FIELD: &str = "TIMESTAMP";

/// Data-grid response envelope.
#[derive(Debug, Deserialize)]
struct GridResponse {
    responses: Vec<GridBlock>,
}

#[derive(Debug, Deserialize)]
struct GridBlock {
    #[serde(default)]
    data: Vec<Vec<Value>>,
    #[serde(default)]
    headers: Vec<Vec<GridHeader>>,
    #[serde(default)]
    error: Vec<GridError>,
}

#[derive(Debug, Deserialize)]
struct GridHeader {
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct GridError {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Time-series response envelope.
#[derive(Debug, Deserialize)]
struct TimeseriesResponse {
    #[serde(rename = "timeseriesData")]
    timeseries_data: Vec<TimeseriesBlock>,
}

#[derive(Debug, Deserialize)]
struct TimeseriesBlock {
    #[serde(rename = "dataPoints", default)]
    data_points: Vec<Vec<Value>>,
    #[serde(default)]
    fields: Vec<TimeseriesField>,
    #[serde(rename = "statusCode", default)]
    status_code: String,
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TimeseriesField {
    name: String,
}

/// HTTP implementation of [`MarketDataClient`].
pub struct HttpClient {
    client: reqwest::blocking::Client,
    base_url: String,
    app_key: String,
}

impl HttpClient {
    pub fn new(config: &FetchConfig) -> Result<Self, EngineError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_key: config.api_key.clone().unwrap_or_default(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/v1/data", self.base_url)
    }

    /// Send one entity request and return the decoded JSON body.
    fn post(&self, entity: &str, arguments: Value) -> Result<Value, UpstreamError> {
        let body = json!({ "Entity": { "E": entity, "W": arguments } });

        let resp = self
            .client
            .post(self.endpoint())
            .header(APP_KEY_HEADER, &self.app_key)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(e.to_string())
                } else if e.is_connect() {
                    UpstreamError::Transport(e.to_string())
                } else {
                    UpstreamError::Malformed(format!("request failed: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("unknown status").to_string();
            let text = resp.text().unwrap_or_default();
            let message = if text.trim().is_empty() {
                reason
            } else {
                format!("{reason}: {}", text.trim())
            };
            return Err(UpstreamError::Status {
                code: status.as_u16(),
                message,
            });
        }

        let value: Value = resp
            .json()
            .map_err(|e| UpstreamError::Malformed(format!("failed to parse response: {e}")))?;

        if let Some(code) = value.get("ErrorCode").and_then(Value::as_i64) {
            let message = value
                .get("ErrorMessage")
                .and_then(Value::as_str)
                .unwrap_or("no message")
                .to_string();
            return Err(UpstreamError::Api { code, message });
        }

        Ok(value)
    }

    fn grid_request(instruments: &[String], fields: &[String], params: &Params) -> Value {
        let fields: Vec<Value> = fields.iter().map(|f| json!({ "name": f })).collect();
        let mut request = json!({ "instruments": instruments, "fields": fields });
        if !params.is_empty() {
            request["parameters"] = json!(params);
        }
        json!({ "requests": [request] })
    }
}

impl MarketDataClient for HttpClient {
    fn name(&self) -> &str {
        "desktop_data_api"
    }

    fn fetch_chain(&self, request: &ChainRequest) -> Result<Payload, UpstreamError> {
        let instrument = format!("{}({})", request.instrument, request.date);
        let arguments = Self::grid_request(&[instrument], &request.fields, &request.params);
        let body = self.post(DATA_GRID_ENTITY, arguments)?;
        parse_grid(body)
    }

    fn fetch_timeseries(&self, request: &TimeseriesRequest) -> Result<Payload, UpstreamError> {
        let mut fields = vec![TIMESTAMP_FIELD.to_string()];
        fields.extend(request.fields.iter().cloned());

        let mut arguments = json!({
            "rics": [request.instrument],
            "fields": fields,
            "interval": request.interval.as_str(),
            "startdate": format!("{}T00:00:00", request.start),
            "enddate": format!("{}T23:59:59", request.end),
            "corax": request.adjustment.as_str(),
        });
        if let Some(calendar) = &request.calendar {
            arguments["calendar"] = json!(calendar);
        }
        if let Some(count) = request.count {
            arguments["count"] = json!(count);
        }

        let body = self.post(TIMESERIES_ENTITY, arguments)?;
        parse_timeseries(body)
    }

    fn fetch_data(&self, request: &DataRequest) -> Result<Payload, UpstreamError> {
        let arguments = Self::grid_request(&request.instruments, &request.fields, &request.params);
        let body = self.post(DATA_GRID_ENTITY, arguments)?;
        parse_grid(body)
    }
}

/// Parse a data-grid body into a table, attaching cell errors as metadata.
fn parse_grid(body: Value) -> Result<Payload, UpstreamError> {
    let resp: GridResponse = serde_json::from_value(body)
        .map_err(|e| UpstreamError::Malformed(format!("data grid: {e}")))?;
    let block = resp
        .responses
        .into_iter()
        .next()
        .ok_or_else(|| UpstreamError::Malformed("data grid has no response block".into()))?;

    let names: Vec<String> = block
        .headers
        .into_iter()
        .next()
        .ok_or_else(|| UpstreamError::Malformed("data grid has no headers".into()))?
        .into_iter()
        .map(|h| h.display_name)
        .collect();

    let mut columns = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let cells: Vec<&Value> = block.data.iter().map(|row| row.get(i).unwrap_or(&Value::Null)).collect();
        columns.push(cells_to_column(name, &cells));
    }

    let table = DataFrame::new(columns)
        .map_err(|e| UpstreamError::Malformed(format!("data grid columns: {e}")))?;

    if block.error.is_empty() {
        Ok(Payload::Table(table))
    } else {
        let meta = serde_json::to_value(&block.error)
            .map_err(|e| UpstreamError::Malformed(format!("data grid errors: {e}")))?;
        Ok(Payload::with_meta(table, meta))
    }
}

/// Numeric when every non-empty cell is a number, text otherwise.
fn cells_to_column(name: &str, cells: &[&Value]) -> Column {
    let numeric = cells.iter().all(|v| is_blank(v) || v.is_number());

    if numeric {
        let values: Vec<f64> = cells
            .iter()
            .map(|v| v.as_f64().unwrap_or(f64::NAN))
            .collect();
        Column::new(name.into(), values)
    } else {
        let values: Vec<Option<String>> = cells
            .iter()
            .map(|v| match v {
                _ if is_blank(v) => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect();
        Column::new(name.into(), values)
    }
}

fn is_blank(value: &Value) -> bool {
    value.is_null() || value.as_str().is_some_and(str::is_empty)
}

/// Parse a time-series body into a `date` + field columns table.
fn parse_timeseries(body: Value) -> Result<Payload, UpstreamError> {
    let resp: TimeseriesResponse = serde_json::from_value(body)
        .map_err(|e| UpstreamError::Malformed(format!("time series: {e}")))?;
    let block = resp
        .timeseries_data
        .into_iter()
        .next()
        .ok_or_else(|| UpstreamError::Malformed("time series has no data block".into()))?;

    if block.status_code.eq_ignore_ascii_case("error") {
        let code = block.error_code.unwrap_or_else(|| "unknown".into());
        let message = block.error_message.unwrap_or_default();
        return Err(UpstreamError::Malformed(format!("{code}: {message}")));
    }

    let timestamp_at = block
        .fields
        .iter()
        .position(|f| f.name.eq_ignore_ascii_case(TIMESTAMP_FIELD))
        .ok_or_else(|| UpstreamError::Malformed("time series has no TIMESTAMP field".into()))?;

    let mut dates = Vec::with_capacity(block.data_points.len());
    for point in &block.data_points {
        let raw = point
            .get(timestamp_at)
            .and_then(Value::as_str)
            .ok_or_else(|| UpstreamError::Malformed("data point without timestamp".into()))?;
        let date = raw
            .get(..10)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .ok_or_else(|| UpstreamError::Malformed(format!("invalid timestamp: {raw}")))?;
        dates.push(date);
    }

    let mut columns = vec![date_column(DATE_COLUMN, &dates)
        .map_err(|e| UpstreamError::Malformed(e.to_string()))?];
    for (i, field) in block.fields.iter().enumerate() {
        if i == timestamp_at {
            continue;
        }
        let values: Vec<f64> = block
            .data_points
            .iter()
            .map(|p| p.get(i).and_then(Value::as_f64).unwrap_or(f64::NAN))
            .collect();
        columns.push(Column::new(field.name.as_str().into(), values));
    }

    let table = DataFrame::new(columns)
        .map_err(|e| UpstreamError::Malformed(format!("time series columns: {e}")))?;
    Ok(Payload::Table(table))
}
