//! Wire messages exchanged with monitoring peers.
//!
//! Frames are newline-delimited JSON objects tagged by `type`:
//!
//! ```text
//! {"type":"hello","id":"…","instance_id":"…","groups":["all","linux"],"hostname":"web-1","version":"0.1.0"}
//! {"type":"query_request","query_id":7,"table":"processes","predicates":[…],"interval_secs":10}
//! {"type":"query_response","query_id":7,"columns":["pid"],"rows":[[{"integer":1}]]}
//! ```

use serde::{Deserialize, Serialize};

use crate::database::{Predicate, Query, Row};

/// Largest accepted frame, in bytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Identity announced by either side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub id: String,
    pub instance_id: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub version: String,
}

/// A query sent by a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query_id: u64,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Re-run every this many seconds until cancelled.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl QueryRequest {
    pub fn to_query(&self) -> Query {
        Query {
            table: self.table.clone(),
            columns: self.columns.clone(),
            predicates: self.predicates.clone(),
            limit: self.limit,
        }
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello(Hello),
    Heartbeat,
    QueryRequest(QueryRequest),
    CancelQuery {
        query_id: u64,
    },
    QueryResponse {
        query_id: u64,
        columns: Vec<String>,
        rows: Vec<Row>,
    },
    Error {
        #[serde(default)]
        query_id: Option<u64>,
        message: String,
    },
}

impl Message {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Heartbeat => "heartbeat",
            Message::QueryRequest(_) => "query_request",
            Message::CancelQuery { .. } => "cancel_query",
            Message::QueryResponse { .. } => "query_response",
            Message::Error { .. } => "error",
        }
    }

    /// Serialize into one newline-terminated frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut frame = serde_json::to_string(self)?;
        frame.push('\n');
        Ok(frame)
    }

    /// Parse one frame, with or without its trailing newline.
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame.trim_end())
    }
}
