use std::collections::HashSet;

use serde_json::json;
use tracing::{debug, info};

use crate::db::Datastore;
use crate::error::Result;
use crate::types::{Event, FunctionCall, LabelRow};

pub const DEFAULT_LABEL_NAME: &str = "crawler-alpha";
pub const DEFAULT_MAX_INSERT_BATCH: usize = 10_000;

/// Writes decoded events and calls as label rows, skipping rows already stored.
///
/// Small writes stay staged in the open session until [`IngestionWriter::commit`];
/// writes above `max_insert_batch` rows are split into chunks committed one by one.
#[derive(Debug, Clone)]
pub struct IngestionWriter {
    label_name: String,
    max_insert_batch: usize,
}

impl IngestionWriter {
    pub fn new(label_name: impl Into<String>, max_insert_batch: usize) -> Self {
        Self {
            label_name: label_name.into(),
            max_insert_batch: max_insert_batch.max(1),
        }
    }

    pub fn label_name(&self) -> &str {
        &self.label_name
    }

    pub fn event_to_label(&self, event: &Event) -> LabelRow {
        LabelRow {
            label: self.label_name.clone(),
            block_number: event.block_number,
            block_timestamp: event.block_timestamp,
            address: event.address.clone(),
            transaction_hash: event.transaction_hash.clone(),
            log_index: Some(event.log_index),
            label_data: json!({
                "type": "event",
                "name": event.event_name,
                "args": event.args,
            }),
        }
    }

    pub fn call_to_label(&self, call: &FunctionCall) -> LabelRow {
        let mut label_data = json!({
            "type": "tx_call",
            "name": call.function_name,
            "caller": call.caller_address,
            "args": call.function_args,
            "status": call.status.map(u8::from),
            "gasUsed": call.gas_used,
            "value": call.value,
        });
        if let Some(obj) = label_data.as_object_mut() {
            if let Some(gas_price) = call.gas_price {
                obj.insert("gasPrice".into(), json!(gas_price.to_string()));
            }
            if let Some(max_fee) = call.max_fee_per_gas {
                obj.insert("maxFeePerGas".into(), json!(max_fee.to_string()));
            }
            if let Some(priority_fee) = call.max_priority_fee_per_gas {
                obj.insert("maxPriorityFeePerGas".into(), json!(priority_fee.to_string()));
            }
        }

        LabelRow {
            label: self.label_name.clone(),
            block_number: call.block_number,
            block_timestamp: call.block_timestamp,
            address: call.contract_address.clone(),
            transaction_hash: call.transaction_hash.clone(),
            log_index: None,
            label_data,
        }
    }

    /// Stage event labels whose `(transaction_hash, log_index)` is not stored yet.
    /// Returns the number of labels written.
    pub async fn add_events_to_session(&self, store: &mut dyn Datastore, events: &[Event]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let tx_hashes = unique_hashes(events.iter().map(|e| &e.transaction_hash));
        let mut seen: HashSet<(String, u64)> = store
            .existing_event_keys(&self.label_name, &tx_hashes)
            .await?
            .into_iter()
            .collect();

        let labels: Vec<LabelRow> = events
            .iter()
            .filter(|event| seen.insert(event.key()))
            .map(|event| self.event_to_label(event))
            .collect();

        let skipped = events.len() - labels.len();
        if skipped > 0 {
            debug!("Skipping {} events already labeled {}", skipped, self.label_name);
        }
        self.write(store, &labels).await
    }

    /// Stage call labels whose transaction has no call label yet. Returns the number written.
    pub async fn add_function_calls_to_session(
        &self,
        store: &mut dyn Datastore,
        calls: &[FunctionCall],
    ) -> Result<usize> {
        if calls.is_empty() {
            return Ok(0);
        }

        let tx_hashes = unique_hashes(calls.iter().map(|c| &c.transaction_hash));
        let mut seen: HashSet<String> = store
            .existing_call_hashes(&self.label_name, &tx_hashes)
            .await?
            .into_iter()
            .collect();

        let labels: Vec<LabelRow> = calls
            .iter()
            .filter(|call| seen.insert(call.transaction_hash.clone()))
            .map(|call| self.call_to_label(call))
            .collect();

        let skipped = calls.len() - labels.len();
        if skipped > 0 {
            debug!("Skipping {} calls already labeled {}", skipped, self.label_name);
        }
        self.write(store, &labels).await
    }

    pub async fn commit(&self, store: &mut dyn Datastore) -> Result<()> {
        store.commit().await
    }

    async fn write(&self, store: &mut dyn Datastore, labels: &[LabelRow]) -> Result<usize> {
        if labels.is_empty() {
            return Ok(0);
        }

        if labels.len() <= self.max_insert_batch {
            if let Err(e) = store.insert_labels(labels).await {
                store.rollback().await?;
                return Err(e);
            }
            return Ok(labels.len());
        }

        for chunk in labels.chunks(self.max_insert_batch) {
            let written = match store.insert_labels(chunk).await {
                Ok(()) => store.commit().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                store.rollback().await?;
                return Err(e);
            }
            info!("Committed {} {} labels", chunk.len(), self.label_name);
        }
        Ok(labels.len())
    }
}

impl Default for IngestionWriter {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL_NAME, DEFAULT_MAX_INSERT_BATCH)
    }
}

fn unique_hashes<'a>(hashes: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut unique: Vec<String> = hashes.cloned().collect();
    unique.sort();
    unique.dedup();
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn call() -> FunctionCall {
        FunctionCall {
            function_name: "transfer".into(),
            function_args: Map::new(),
            caller_address: "0x00000000000000000000000000000000000000c1".into(),
            contract_address: "0x0000000000000000000000000000000000000abc".into(),
            block_number: 10,
            block_timestamp: 1_700_000_000,
            transaction_hash: "0x01".into(),
            value: "0".into(),
            status: Some(true),
            gas_used: Some(21_000),
            gas_price: Some(7),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        }
    }

    #[test]
    fn test_call_label_shape() {
        let writer = IngestionWriter::default();
        let label = writer.call_to_label(&call());

        assert_eq!(label.label, DEFAULT_LABEL_NAME);
        assert_eq!(label.log_index, None);
        assert_eq!(label.label_data["type"], "tx_call");
        assert_eq!(label.label_data["status"], 1);
        assert_eq!(label.label_data["gasUsed"], 21_000);
        assert_eq!(label.label_data["gasPrice"], "7");
        assert!(label.label_data.get("maxFeePerGas").is_none());
    }

    #[test]
    fn test_unique_hashes() {
        let hashes = ["0x2".to_string(), "0x1".to_string(), "0x2".to_string()];
        assert_eq!(unique_hashes(hashes.iter()), vec!["0x1".to_string(), "0x2".to_string()]);
    }
}
