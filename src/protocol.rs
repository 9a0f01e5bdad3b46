use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Backend routing hint for a question.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Sql,
    Rag,
    #[serde(alias = "financial")]
    #[value(alias = "financial", alias = "financial_analysis")]
    FinancialAnalysis,
    #[value(alias = "money_flow")]
    MoneyFlow,
    Hybrid,
}

impl QueryType {
    pub const ALL: [QueryType; 5] = [
        QueryType::Sql,
        QueryType::Rag,
        QueryType::FinancialAnalysis,
        QueryType::MoneyFlow,
        QueryType::Hybrid,
    ];

    /// Parse the wire name, accepting `financial` and dashes for underscores.
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "sql" => Ok(QueryType::Sql),
            "rag" => Ok(QueryType::Rag),
            "financial" | "financial_analysis" => Ok(QueryType::FinancialAnalysis),
            "money_flow" => Ok(QueryType::MoneyFlow),
            "hybrid" => Ok(QueryType::Hybrid),
            _ => Err(format!("Unknown query type: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Sql => "sql",
            QueryType::Rag => "rag",
            QueryType::FinancialAnalysis => "financial_analysis",
            QueryType::MoneyFlow => "money_flow",
            QueryType::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// -- HTTP query types --------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    pub question: String,
    pub query_type: QueryType,
    pub top_k: u32,
}

/// Structured payloads attached to an answer, shown in the source panel.
///
/// The backend has shipped several shapes over time; the flat keys
/// (`sql_data`, `documents`, ...) and the per-agent keys (`sql`, `rag`, ...)
/// are both accepted. Anything else is kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sources {
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub sql_data: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub financial: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub money_flow: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Sources {
    pub fn is_empty(&self) -> bool {
        self.sql_data.is_empty()
            && self.documents.is_empty()
            && self.table_data.as_ref().map_or(true, Value::is_null)
            && self.chart_data.as_ref().map_or(true, Value::is_null)
            && self.sql.as_ref().map_or(true, Value::is_null)
            && self.rag.as_ref().map_or(true, Value::is_null)
            && self.financial.as_ref().map_or(true, Value::is_null)
            && self.money_flow.as_ref().map_or(true, Value::is_null)
            && self.extra.values().all(Value::is_null)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub sources: Option<Sources>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub query_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub mysql: Option<bool>,
    #[serde(default)]
    pub milvus: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.as_deref().map_or(true, |s| s.eq_ignore_ascii_case("healthy"))
    }
}

// -- NDJSON streaming endpoint -----------------------------------------------

/// One line of the `POST /query/stream` response body.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        #[serde(default)]
        query_id: Option<String>,
    },
    Chunk {
        #[serde(default)]
        content: String,
    },
    Complete {
        #[serde(default)]
        query_id: Option<String>,
        #[serde(default)]
        sources: Option<Sources>,
    },
    Error {
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

// -- WebSocket frames --------------------------------------------------------

/// Frames the client sends over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Query {
        question: String,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query_type: Option<QueryType>,
    },
    Ping,
}

/// Frames the server pushes over the socket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
    Processing {
        #[serde(default)]
        query_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Stream {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        query_id: Option<String>,
        #[serde(default, alias = "delta")]
        content: String,
    },
    Complete {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        query_id: Option<String>,
        /// Full answer; replaces the streamed text when present.
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        sources: Option<Sources>,
    },
    Result {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        query_id: Option<String>,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        answer: Option<String>,
        #[serde(default)]
        query_type: Option<String>,
        #[serde(default)]
        sources: Option<Sources>,
        #[serde(default)]
        error: Option<String>,
    },
    AnalysisResult {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        query_id: Option<String>,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        analysis_type: Option<String>,
        #[serde(default)]
        answer: Option<String>,
        #[serde(default, alias = "analysis_report")]
        report: Option<String>,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        query_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            ServerFrame::Processing { message_id, .. }
            | ServerFrame::Stream { message_id, .. }
            | ServerFrame::Complete { message_id, .. }
            | ServerFrame::Result { message_id, .. }
            | ServerFrame::AnalysisResult { message_id, .. }
            | ServerFrame::Error { message_id, .. } => message_id.as_deref(),
            _ => None,
        }
    }

    pub fn query_id(&self) -> Option<&str> {
        match self {
            ServerFrame::Processing { query_id, .. }
            | ServerFrame::Stream { query_id, .. }
            | ServerFrame::Complete { query_id, .. }
            | ServerFrame::Result { query_id, .. }
            | ServerFrame::AnalysisResult { query_id, .. }
            | ServerFrame::Error { query_id, .. } => query_id.as_deref(),
            _ => None,
        }
    }
}
