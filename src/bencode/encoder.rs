use super::BencodeValue;

/// Encode a value back into its canonical bencode byte form. Dictionary
/// keys come out sorted because the tree stores them in a `BTreeMap`.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &BencodeValue, out: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        BencodeValue::Bytes(bytes) => write_bytes(bytes, out),
        BencodeValue::List(items) => {
            out.push(b'l');
            for item in items {
                write_value(item, out);
            }
            out.push(b'e');
        }
        BencodeValue::Dict(entries) => {
            out.push(b'd');
            for (key, entry) in entries {
                write_bytes(key, out);
                write_value(entry, out);
            }
            out.push(b'e');
        }
    }
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
