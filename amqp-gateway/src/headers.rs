//! Conversions between JSON header maps and AMQP field tables

use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use serde_json::Value;
use std::collections::HashMap;

/// Build an AMQP field table from a JSON header map
pub(crate) fn to_field_table(headers: &HashMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), to_amqp_value(value));
    }
    table
}

pub(crate) fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        other => AMQPValue::LongString(other.to_string().as_str().into()),
    }
}

/// Read a header as a string, tolerating the value types brokers and
/// clients actually put in field tables.
pub(crate) fn header_string(properties: &BasicProperties, name: &str) -> Option<String> {
    let headers = properties.headers().as_ref()?;
    match headers.inner().get(&ShortString::from(name))? {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::LongLongInt(i) => Some(i.to_string()),
        AMQPValue::LongInt(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Read a header as an integer, accepting numeric strings
pub(crate) fn header_i64(properties: &BasicProperties, name: &str) -> Option<i64> {
    let headers = properties.headers().as_ref()?;
    match headers.inner().get(&ShortString::from(name))? {
        AMQPValue::LongLongInt(i) => Some(*i),
        AMQPValue::LongInt(i) => Some(i64::from(*i)),
        AMQPValue::ShortInt(i) => Some(i64::from(*i)),
        AMQPValue::ShortShortInt(i) => Some(i64::from(*i)),
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props_with(name: &str, value: AMQPValue) -> BasicProperties {
        let mut table = FieldTable::default();
        table.insert(name.into(), value);
        BasicProperties::default().with_headers(table)
    }

    #[test]
    fn test_to_field_table_value_types() {
        let mut headers = HashMap::new();
        headers.insert("s".to_string(), json!("text"));
        headers.insert("b".to_string(), json!(true));
        headers.insert("n".to_string(), json!(7));

        let table = to_field_table(&headers);
        assert_eq!(
            table.inner().get(&ShortString::from("s")),
            Some(&AMQPValue::LongString("text".into()))
        );
        assert_eq!(
            table.inner().get(&ShortString::from("b")),
            Some(&AMQPValue::Boolean(true))
        );
        assert_eq!(
            table.inner().get(&ShortString::from("n")),
            Some(&AMQPValue::LongLongInt(7))
        );
    }

    #[test]
    fn test_header_string() {
        let props = props_with("messageId", AMQPValue::LongString("abc-123".into()));
        assert_eq!(header_string(&props, "messageId").as_deref(), Some("abc-123"));
        assert_eq!(header_string(&props, "missing"), None);
    }

    #[test]
    fn test_header_i64_accepts_numeric_strings() {
        let props = props_with("reboundIteration", AMQPValue::LongString("4".into()));
        assert_eq!(header_i64(&props, "reboundIteration"), Some(4));

        let props = props_with("reboundIteration", AMQPValue::LongLongInt(2));
        assert_eq!(header_i64(&props, "reboundIteration"), Some(2));
    }
}
