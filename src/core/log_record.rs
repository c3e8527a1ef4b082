use crate::core::constants::TransactionID;
use crate::core::errors::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of every WAL entry the engine writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    /// `record` is the packed record, exactly as written into the page.
    Insert {
        relation: String,
        curvature: f64,
        record: Vec<u8>,
    },
    TxnWrite {
        txn_id: TransactionID,
        resource_id: String,
        old_value: Option<Value>,
        new_value: Value,
        timestamp: u64,
    },
    TxnCommit {
        txn_id: TransactionID,
    },
    TxnAbort {
        txn_id: TransactionID,
    },
}

impl LogRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::SerializationError {
            context: "wal log record".to_string(),
            error: e.to_string(),
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::SerializationError {
            context: "wal log record".to_string(),
            error: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_encoding() {
        let record = LogRecord::TxnCommit { txn_id: 9 };
        let encoded = record.encode().unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value, json!({"type": "txn_commit", "txn_id": 9}));
    }

    #[test]
    fn test_txn_write_decodes() {
        let record = LogRecord::TxnWrite {
            txn_id: 1,
            resource_id: "r1".to_string(),
            old_value: None,
            new_value: json!("a"),
            timestamp: 42,
        };
        assert_eq!(LogRecord::decode(&record.encode().unwrap()).unwrap(), record);
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert!(matches!(
            LogRecord::decode(b"not json"),
            Err(Error::SerializationError { .. })
        ));
    }
}
