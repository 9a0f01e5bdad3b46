//! Source panel: typed views over the structured payloads attached to an answer.

use serde_json::{Map, Value};

use crate::protocol::Sources;

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentExcerpt {
    pub title: Option<String>,
    pub source: Option<String>,
    pub date: Option<String>,
    pub score: Option<f64>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceView {
    Sql {
        query: Option<String>,
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    /// SQL agent output the agent already formatted as text.
    SqlText {
        query: Option<String>,
        text: String,
    },
    Documents(Vec<DocumentExcerpt>),
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    /// Charts are not drawn in the terminal; the payload is kept for export.
    Chart(Value),
    Analysis {
        kind: String,
        body: Value,
    },
}

impl SourceView {
    pub fn title(&self) -> String {
        match self {
            SourceView::Sql { rows, .. } => format!("SQL result ({} rows)", rows.len()),
            SourceView::SqlText { .. } => "SQL result".to_string(),
            SourceView::Documents(docs) => format!("Documents ({})", docs.len()),
            SourceView::Table { rows, .. } => format!("Table ({} rows)", rows.len()),
            SourceView::Chart(_) => "Chart".to_string(),
            SourceView::Analysis { kind, .. } => format!("Analysis: {kind}"),
        }
    }
}

fn cell(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Column headers in first-seen order across all records.
fn record_headers(records: &[Value]) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for rec in records {
        if let Value::Object(map) = rec {
            for key in map.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
        }
    }
    headers
}

fn records_to_rows(records: &[Value]) -> (Vec<String>, Vec<Vec<String>>) {
    let headers = record_headers(records);
    let rows = records
        .iter()
        .map(|rec| match rec {
            Value::Object(map) => headers.iter().map(|h| map.get(h).map(cell).unwrap_or_default()).collect(),
            Value::Array(items) => items.iter().map(cell).collect(),
            scalar => vec![cell(scalar)],
        })
        .collect();
    (headers, rows)
}

fn str_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| map.get(*k))
        .filter(|v| !v.is_null())
        .map(cell)
}

fn document(v: &Value) -> DocumentExcerpt {
    let Value::Object(map) = v else {
        return DocumentExcerpt {
            title: None,
            source: None,
            date: None,
            score: None,
            content: cell(v),
        };
    };
    let empty = Map::new();
    let meta = match map.get("metadata") {
        Some(Value::Object(m)) => m,
        _ => &empty,
    };
    let pick = |keys: &[&str]| str_field(meta, keys).or_else(|| str_field(map, keys));
    DocumentExcerpt {
        title: pick(&["title", "name"][..]),
        source: pick(&["source", "ts_code", "file_name"][..]),
        date: pick(&["date", "ann_date", "publish_date"][..]),
        score: map
            .get("score")
            .or_else(|| map.get("distance"))
            .and_then(Value::as_f64),
        content: str_field(map, &["content", "text", "page_content"]).unwrap_or_default(),
    }
}

fn table(v: &Value) -> Option<SourceView> {
    match v {
        Value::Object(map) if map.contains_key("rows") => {
            let headers = map
                .get("headers")
                .and_then(Value::as_array)
                .map(|h| h.iter().map(cell).collect())
                .unwrap_or_default();
            let rows = map
                .get("rows")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .map(|r| match r {
                            Value::Array(items) => items.iter().map(cell).collect(),
                            other => vec![cell(other)],
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(SourceView::Table { headers, rows })
        }
        Value::Array(records) if !records.is_empty() => {
            let (headers, rows) = records_to_rows(records);
            Some(SourceView::Table { headers, rows })
        }
        _ => None,
    }
}

/// Build every view the payload supports, in panel order.
pub fn views(sources: &Sources) -> Vec<SourceView> {
    let mut out = Vec::new();

    if !sources.sql_data.is_empty() {
        let (headers, rows) = records_to_rows(&sources.sql_data);
        out.push(SourceView::Sql {
            query: None,
            headers,
            rows,
        });
    }
    if let Some(Value::Object(sql)) = &sources.sql {
        let query = str_field(sql, &["sql", "query"]);
        match sql.get("result") {
            Some(Value::Array(result)) => {
                let (headers, rows) = records_to_rows(result);
                out.push(SourceView::Sql { query, headers, rows });
            }
            Some(Value::String(text)) if !text.trim().is_empty() => out.push(SourceView::SqlText {
                query,
                text: text.clone(),
            }),
            _ => {}
        }
    }

    let mut docs: Vec<DocumentExcerpt> = sources.documents.iter().map(document).collect();
    if let Some(Value::Object(rag)) = &sources.rag {
        if let Some(Value::Array(items)) = rag.get("documents") {
            docs.extend(items.iter().map(document));
        }
    }
    if !docs.is_empty() {
        out.push(SourceView::Documents(docs));
    }

    if let Some(view) = sources.table_data.as_ref().and_then(table) {
        out.push(view);
    }
    if let Some(chart) = sources.chart_data.as_ref().filter(|c| !c.is_null()) {
        out.push(SourceView::Chart(chart.clone()));
    }

    let analyses = [("financial", &sources.financial), ("money_flow", &sources.money_flow)];
    for (kind, body) in analyses {
        if let Some(body) = body.as_ref().filter(|b| !b.is_null()) {
            out.push(SourceView::Analysis {
                kind: kind.to_string(),
                body: body.clone(),
            });
        }
    }
    for (kind, body) in &sources.extra {
        if !body.is_null() {
            out.push(SourceView::Analysis {
                kind: kind.clone(),
                body: body.clone(),
            });
        }
    }
    out
}

/// One-line description for the transcript, e.g. `3 SQL rows, 2 documents`.
pub fn summary(sources: &Sources) -> String {
    let parts: Vec<String> = views(sources)
        .iter()
        .map(|v| match v {
            SourceView::Sql { rows, .. } => plural(rows.len(), "SQL row"),
            SourceView::SqlText { .. } => "SQL result".to_string(),
            SourceView::Documents(d) => plural(d.len(), "document"),
            SourceView::Table { rows, .. } => format!("table of {}", plural(rows.len(), "row")),
            SourceView::Chart(_) => "chart".to_string(),
            SourceView::Analysis { kind, .. } => format!("{} data", kind.replace('_', " ")),
        })
        .collect();
    parts.join(", ")
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

fn render_grid(headers: &[String], rows: &[Vec<String>]) -> String {
    let cols = rows.iter().map(Vec::len).chain([headers.len()]).max().unwrap_or(0);
    let mut widths = vec![0usize; cols];
    for row in std::iter::once(headers).chain(rows.iter().map(Vec::as_slice)) {
        for (i, c) in row.iter().enumerate() {
            widths[i] = widths[i].max(c.chars().count());
        }
    }
    let line = |row: &[String]| -> String {
        (0..cols)
            .map(|i| {
                let c = row.get(i).map(String::as_str).unwrap_or("");
                let pad = widths[i] - c.chars().count();
                format!("{c}{}", " ".repeat(pad))
            })
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    if !headers.is_empty() {
        out.push_str(&line(headers));
        out.push('\n');
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push_str(&rule.join("-+-"));
        out.push('\n');
    }
    for row in rows {
        out.push_str(&line(row));
        out.push('\n');
    }
    out
}

/// Plain-text rendering for the terminal side panel.
pub fn render_view(view: &SourceView) -> String {
    let mut out = format!("== {} ==\n", view.title());
    match view {
        SourceView::Sql { query, headers, rows } => {
            if let Some(q) = query {
                out.push_str(&format!("SQL: {q}\n"));
            }
            out.push_str(&render_grid(headers, rows));
        }
        SourceView::SqlText { query, text } => {
            if let Some(q) = query {
                out.push_str(&format!("SQL: {q}\n"));
            }
            out.push_str(text);
            if !text.ends_with('\n') {
                out.push('\n');
            }
        }
        SourceView::Table { headers, rows } => out.push_str(&render_grid(headers, rows)),
        SourceView::Documents(docs) => {
            for (i, doc) in docs.iter().enumerate() {
                out.push_str(&format!("[{}] {}\n", i + 1, doc.title.as_deref().unwrap_or("Document")));
                if let Some(s) = &doc.source {
                    out.push_str(&format!("    source: {s}\n"));
                }
                if let Some(d) = &doc.date {
                    out.push_str(&format!("    date: {d}\n"));
                }
                if let Some(score) = doc.score {
                    out.push_str(&format!("    score: {score:.3}\n"));
                }
                for line in doc.content.lines() {
                    out.push_str(&format!("    {line}\n"));
                }
            }
        }
        SourceView::Chart(data) => {
            let series = data
                .get("series")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            out.push_str(&format!("[chart with {series} series, not rendered in the terminal]\n"));
        }
        SourceView::Analysis { body, .. } => {
            let pretty = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());
            out.push_str(&pretty);
            out.push('\n');
        }
    }
    out
}
