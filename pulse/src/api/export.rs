//! Telemetry export.
//!
//! Serializes a selected stream over a range as a JSON document or an
//! RFC 4180 CSV attachment.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::error::ApiError;
use crate::engine::Pulse;
use crate::storage::{AlertFilter, ErrorFilter};
use crate::timerange::TimeRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportType {
    Requests,
    Queries,
    Errors,
    Runtime,
    Alerts,
}

impl ExportType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Queries => "queries",
            Self::Errors => "errors",
            Self::Runtime => "runtime",
            Self::Alerts => "alerts",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub format: ExportFormat,
    #[serde(rename = "type")]
    pub kind: ExportType,
    #[serde(default)]
    pub range: TimeRange,
}

/// `POST <p>/api/data/export`
pub async fn export(
    State(pulse): State<Arc<Pulse>>,
    Json(body): Json<ExportRequest>,
) -> Result<Response, ApiError> {
    let (from, to) = body.range.bounds();
    let storage = pulse.storage();

    let (json, csv) = match body.kind {
        ExportType::Requests => {
            let records = storage.requests_in(from, to);
            (serde_json::to_value(&records), requests_csv(&records))
        }
        ExportType::Queries => {
            let records = storage.queries_in(from, to);
            (serde_json::to_value(&records), queries_csv(&records))
        }
        ExportType::Errors => {
            let records: Vec<_> = storage
                .errors(&ErrorFilter::default())
                .into_iter()
                .filter(|e| e.last_seen >= from)
                .collect();
            (serde_json::to_value(&records), errors_csv(&records))
        }
        ExportType::Runtime => {
            let records = storage.runtime_samples_in(from, to);
            (serde_json::to_value(&records), runtime_csv(&records))
        }
        ExportType::Alerts => {
            let records = storage.alerts(&AlertFilter {
                since: Some(from),
                ..AlertFilter::default()
            });
            (serde_json::to_value(&records), alerts_csv(&records))
        }
    };

    let filename = format!(
        "pulse_{}_{}.{}",
        body.kind.as_str(),
        body.range.as_str(),
        match body.format {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    );

    let (content_type, payload) = match body.format {
        ExportFormat::Json => {
            let value = json.map_err(|e| ApiError::Internal(e.to_string()))?;
            let text = serde_json::to_string_pretty(&value)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            ("application/json", text)
        }
        ExportFormat::Csv => ("text/csv", csv),
    };

    Ok((
        [
            (CONTENT_TYPE, content_type.to_string()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        payload,
    )
        .into_response())
}

// ============================================================================
// CSV rendering
// ============================================================================

/// Quote a field per RFC 4180 when it contains a comma, quote or newline.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

fn requests_csv(records: &[crate::model::RequestRecord]) -> String {
    let mut out = String::from(
        "timestamp,method,route,status,latency_ms,request_bytes,response_bytes,client_ip,trace_id,error\n",
    );
    for r in records {
        out.push_str(&csv_line(&[
            r.timestamp.to_rfc3339(),
            r.method.clone(),
            r.route.clone(),
            r.status.to_string(),
            format!("{:.3}", r.latency_ms),
            r.request_bytes.to_string(),
            r.response_bytes.to_string(),
            r.client_ip.clone(),
            r.trace_id.clone(),
            r.error.clone().unwrap_or_default(),
        ]));
        out.push('\n');
    }
    out
}

fn queries_csv(records: &[crate::model::QueryRecord]) -> String {
    let mut out = String::from(
        "timestamp,operation,table,duration_ms,rows,caller,trace_id,normalized,error\n",
    );
    for q in records {
        out.push_str(&csv_line(&[
            q.timestamp.to_rfc3339(),
            q.operation.clone(),
            q.table.clone(),
            format!("{:.3}", q.duration_ms),
            q.rows.to_string(),
            q.caller.clone(),
            q.trace_id.clone(),
            q.normalized.clone(),
            q.error.clone().unwrap_or_default(),
        ]));
        out.push('\n');
    }
    out
}

fn errors_csv(records: &[crate::model::ErrorRecord]) -> String {
    let mut out = String::from(
        "first_seen,last_seen,fingerprint,method,route,type,count,muted,resolved,message\n",
    );
    for e in records {
        out.push_str(&csv_line(&[
            e.first_seen.to_rfc3339(),
            e.last_seen.to_rfc3339(),
            e.fingerprint.clone(),
            e.method.clone(),
            e.route.clone(),
            e.kind.as_str().to_string(),
            e.count.to_string(),
            e.muted.to_string(),
            e.resolved.to_string(),
            e.message.clone(),
        ]));
        out.push('\n');
    }
    out
}

fn runtime_csv(records: &[crate::model::RuntimeSample]) -> String {
    let mut out = String::from(
        "timestamp,heap_alloc_bytes,heap_in_use_bytes,heap_objects,total_alloc_bytes,rss_bytes,tasks,workers\n",
    );
    for s in records {
        out.push_str(&csv_line(&[
            s.timestamp.to_rfc3339(),
            s.heap_alloc_bytes.to_string(),
            s.heap_in_use_bytes.to_string(),
            s.heap_objects.to_string(),
            s.total_alloc_bytes.to_string(),
            s.rss_bytes.to_string(),
            s.tasks.to_string(),
            s.workers.to_string(),
        ]));
        out.push('\n');
    }
    out
}

fn alerts_csv(records: &[crate::model::AlertRecord]) -> String {
    let mut out = String::from(
        "fired_at,rule,metric,value,threshold,operator,severity,state,route,message\n",
    );
    for a in records {
        out.push_str(&csv_line(&[
            a.fired_at.to_rfc3339(),
            a.rule.clone(),
            a.metric.clone(),
            format!("{:.3}", a.value),
            format!("{:.3}", a.threshold),
            a.operator.clone(),
            a.severity.as_str().to_string(),
            a.state.as_str().to_string(),
            a.route.clone().unwrap_or_default(),
            a.message.clone(),
        ]));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn csv_escaping() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn requests_csv_has_header_and_rows() {
        let record = crate::model::RequestRecord {
            method: "GET".into(),
            route: "/users/{id}".into(),
            status: 200,
            latency_ms: 1.5,
            request_bytes: 0,
            response_bytes: 64,
            client_ip: "10.0.0.1".into(),
            user_agent: "test".into(),
            error: Some("oops, \"quoted\"".into()),
            trace_id: "ab".repeat(16),
            timestamp: Utc::now(),
        };
        let csv = requests_csv(&[record.clone(), record]);
        let lines: Vec<&str> = csv.trim_end().lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 rows
        assert!(lines[0].starts_with("timestamp,method,route"));
        assert!(lines[1].contains("\"oops, \"\"quoted\"\"\""));
    }

    #[test]
    fn export_request_parses() {
        let body: ExportRequest =
            serde_json::from_str(r#"{"format": "csv", "type": "errors", "range": "24h"}"#).unwrap();
        assert_eq!(body.format, ExportFormat::Csv);
        assert_eq!(body.kind, ExportType::Errors);
        assert_eq!(body.range, TimeRange::TwentyFourHours);
    }

    #[test]
    fn json_export_round_trips() {
        let record = crate::model::AlertRecord {
            id: uuid::Uuid::new_v4(),
            rule: "r".into(),
            metric: "error_rate".into(),
            value: 11.0,
            threshold: 10.0,
            operator: ">".into(),
            severity: crate::model::Severity::Critical,
            state: crate::model::AlertState::Firing,
            route: None,
            message: "m".into(),
            fired_at: Utc::now(),
            resolved_at: None,
        };
        let json = serde_json::to_string(&vec![record.clone()]).unwrap();
        let back: Vec<crate::model::AlertRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[0].id, record.id);
        assert_eq!(back[0].state, record.state);
    }
}
