use super::value::Value;

/// Encode a value into canonical bencode.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buffer = Vec::new();
    encode_into(value, &mut buffer);
    buffer
}

fn encode_into(value: &Value, buffer: &mut Vec<u8>) {
    match value {
        Value::Bytes(bytes) => encode_bytes(bytes, buffer),
        Value::Integer(int) => {
            buffer.push(b'i');
            buffer.extend(int.to_string().as_bytes());
            buffer.push(b'e');
        }
        Value::List(list) => {
            buffer.push(b'l');
            for item in list {
                encode_into(item, buffer);
            }
            buffer.push(b'e');
        }
        Value::Dict(dict) => {
            buffer.push(b'd');
            // BTreeMap iterates in byte-wise key order.
            for (key, item) in dict {
                encode_bytes(key, buffer);
                encode_into(item, buffer);
            }
            buffer.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], buffer: &mut Vec<u8>) {
    buffer.extend(bytes.len().to_string().as_bytes());
    buffer.push(b':');
    buffer.extend(bytes);
}
