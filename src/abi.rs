//! ABI descriptor parsing and decoding of logs and calldata into JSON arguments.

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::{Event, EventParam, Function};
use alloy_primitives::B256;
use serde_json::{Map, Value};
use sha3::{Digest, Sha3_256};

use crate::error::{CrawlerError, Result};

/// Fill in fields that older ABI emitters leave out so `alloy_json_abi` accepts the item.
///
/// Events without `anonymous` are treated as non-anonymous, event inputs without
/// `indexed` as non-indexed, functions without `outputs`/`stateMutability` as
/// returning nothing and non-payable.
pub fn normalize_abi_item(item: &mut Value) {
    let Value::Object(obj) = item else { return };

    match obj.get("type").and_then(Value::as_str) {
        Some("event") => {
            obj.entry("anonymous").or_insert(Value::Bool(false));
            if let Some(Value::Array(inputs)) = obj.get_mut("inputs") {
                for input in inputs.iter_mut() {
                    if let Value::Object(param) = input {
                        param.entry("indexed").or_insert(Value::Bool(false));
                    }
                }
            }
        }
        Some("function") | None => {
            obj.entry("type").or_insert(Value::String("function".to_string()));
            obj.entry("outputs").or_insert(Value::Array(Vec::new()));
            if !obj.contains_key("stateMutability") {
                let payable = obj.get("payable").and_then(Value::as_bool).unwrap_or(false);
                let constant = obj.get("constant").and_then(Value::as_bool).unwrap_or(false);
                let mutability = match (payable, constant) {
                    (true, _) => "payable",
                    (false, true) => "view",
                    _ => "nonpayable",
                };
                obj.insert("stateMutability".to_string(), Value::String(mutability.to_string()));
            }
        }
        _ => {}
    }
}

/// Extract the single ABI item of `kind` from a job descriptor's content.
///
/// Content is either one ABI item or an ABI array holding exactly the item.
fn select_abi_item(content: &str, kind: &str) -> Result<Value> {
    let raw: Value = serde_json::from_str(content)
        .map_err(|e| CrawlerError::Abi(format!("ABI content is not JSON: {}", e)))?;

    let mut item = match raw {
        Value::Array(items) => items
            .into_iter()
            .find(|i| i.get("type").and_then(Value::as_str) == Some(kind))
            .ok_or_else(|| CrawlerError::Abi(format!("No {} item in ABI array", kind)))?,
        obj @ Value::Object(_) => obj,
        other => return Err(CrawlerError::Abi(format!("Unexpected ABI content: {}", other))),
    };

    normalize_abi_item(&mut item);
    Ok(item)
}

pub fn parse_event_abi(content: &str) -> Result<Event> {
    let item = select_abi_item(content, "event")?;
    serde_json::from_value(item).map_err(|e| CrawlerError::Abi(format!("Invalid event ABI: {}", e)))
}

pub fn parse_function_abi(content: &str) -> Result<Function> {
    let item = select_abi_item(content, "function")?;
    serde_json::from_value(item)
        .map_err(|e| CrawlerError::Abi(format!("Invalid function ABI: {}", e)))
}

/// Hex encoded 4-byte selector, e.g. `0xa9059cbb`.
pub fn selector_hex(function: &Function) -> String {
    format!("0x{}", hex::encode(function.selector()))
}

/// Stable digest of a set of ABI descriptors, independent of their order.
pub fn abi_set_hash(items: &[Value]) -> String {
    let mut encoded: Vec<String> = items.iter().map(Value::to_string).collect();
    encoded.sort();
    encoded.dedup();

    let mut hasher = Sha3_256::new();
    hasher.update(Value::from(encoded).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn param_name(name: &str, position: usize) -> String {
    if name.is_empty() {
        format!("arg{}", position)
    } else {
        name.to_string()
    }
}

/// Decode a log against an event definition into `name -> value` arguments.
pub fn decode_event_log(event: &Event, topics: &[B256], data: &[u8]) -> Result<Map<String, Value>> {
    // Non-anonymous events spend topic0 on the signature
    let mut topic_index = if event.anonymous {
        0
    } else {
        match topics.first() {
            Some(topic0) if *topic0 == event.selector() => 1,
            Some(topic0) => {
                return Err(CrawlerError::Decoding(format!(
                    "Topic {} does not match event {} signature",
                    topic0, event.name
                )))
            }
            None => return Err(CrawlerError::Decoding(format!("Log for {} has no topics", event.name))),
        }
    };

    let non_indexed: Vec<(usize, &EventParam)> = event
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.indexed)
        .collect();

    let mut body_values = decode_data_params(&non_indexed, data)?.into_iter();
    let mut args = Map::new();

    for (position, param) in event.inputs.iter().enumerate() {
        let value = if param.indexed {
            let topic = topics.get(topic_index).ok_or_else(|| {
                CrawlerError::Decoding(format!(
                    "Not enough topics for indexed parameter {} of {}",
                    param.name, event.name
                ))
            })?;
            topic_index += 1;
            decode_indexed_param(param, *topic)?
        } else {
            body_values.next().ok_or_else(|| {
                CrawlerError::Decoding(format!("Missing data value for {} of {}", param.name, event.name))
            })?
        };
        args.insert(param_name(&param.name, position), value_to_json(&value));
    }

    Ok(args)
}

/// Decode an indexed parameter from a topic
fn decode_indexed_param(param: &EventParam, topic: B256) -> Result<DynSolValue> {
    let sol_type: DynSolType = param
        .resolve()
        .map_err(|e| CrawlerError::Abi(format!("Unsupported type {} for {}: {}", param.ty, param.name, e)))?;

    match &sol_type {
        // Dynamic types are stored as keccak256 hashes in topics
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(_, _)
        | DynSolType::Tuple(_) => Ok(DynSolValue::FixedBytes(topic, 32)),
        _ => sol_type
            .abi_decode(topic.as_slice())
            .map_err(|e| CrawlerError::Decoding(format!("Failed to decode indexed parameter {}: {}", param.name, e))),
    }
}

/// Decode non-indexed parameters from log data
fn decode_data_params(params: &[(usize, &EventParam)], data: &[u8]) -> Result<Vec<DynSolValue>> {
    if params.is_empty() {
        return Ok(Vec::new());
    }

    let types = params
        .iter()
        .map(|(_, p)| {
            p.resolve().map_err(|e| {
                CrawlerError::Abi(format!("Unsupported type {} for {}: {}", p.ty, p.name, e))
            })
        })
        .collect::<Result<Vec<DynSolType>>>()?;

    decode_tuple(types, data)
}

fn decode_tuple(types: Vec<DynSolType>, data: &[u8]) -> Result<Vec<DynSolValue>> {
    let decoded = DynSolType::Tuple(types)
        .abi_decode_params(data)
        .map_err(|e| CrawlerError::Decoding(format!("Failed to decode ABI data: {}", e)))?;

    match decoded {
        DynSolValue::Tuple(values) => Ok(values),
        _ => Err(CrawlerError::Decoding("Expected tuple from ABI data decoding".to_string())),
    }
}

/// Decode transaction input against a function definition.
///
/// Returns `Ok(None)` when the input does not start with the function's selector.
pub fn decode_calldata(function: &Function, input: &[u8]) -> Result<Option<Map<String, Value>>> {
    if input.len() < 4 || input[..4] != function.selector()[..] {
        return Ok(None);
    }

    let types = function
        .inputs
        .iter()
        .map(|p| {
            p.resolve().map_err(|e| {
                CrawlerError::Abi(format!("Unsupported type {} for {}: {}", p.ty, p.name, e))
            })
        })
        .collect::<Result<Vec<DynSolType>>>()?;

    let values = decode_tuple(types, &input[4..])?;

    let mut args = Map::new();
    for (position, (param, value)) in function.inputs.iter().zip(values.iter()).enumerate() {
        args.insert(param_name(&param.name, position), value_to_json(value));
    }

    Ok(Some(args))
}

/// Convert DynSolValue to JSON Value for serialization
pub fn value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(bytes, size) => {
            Value::String(format!("0x{}", hex::encode(&bytes[..(*size).min(32)])))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::Address(addr) => Value::String(addr.to_string()),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(arr) | DynSolValue::FixedArray(arr) | DynSolValue::Tuple(arr) => {
            Value::Array(arr.iter().map(value_to_json).collect())
        }
        _ => Value::String(format!("{:?}", value)),
    }
}
