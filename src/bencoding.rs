use std::collections::HashMap;

type IndexOfError = usize;

/// A bencoded value. Dicts carry the byte range they were decoded from so
/// that callers can hash the original bytes (re-encoding is not canonical
/// across implementations).
#[derive(PartialEq, Debug, Clone)]
pub enum Value {
    Error(IndexOfError),
    Str(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(HashMap<Vec<u8>, Value>, usize, usize), // entries, start byte, end byte (exclusive)
}

impl Value {
    pub fn new(source: &[u8]) -> Self {
        Self::from_bytes(source, 0).0
    }

    /// Decodes the value at the start of `source` and also returns how many
    /// bytes it consumed, for payloads that carry trailing raw data.
    pub fn new_with_size(source: &[u8]) -> (Self, usize) {
        Self::from_bytes(source, 0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Error(_) => {}
            Value::Str(string_value) => encode_byte_string(string_value, buf),
            Value::Int(int_value) => {
                buf.extend_from_slice(format!("i{}e", int_value).as_bytes());
            }
            Value::List(list_value) => {
                buf.push(b'l');
                for v in list_value {
                    v.encode_into(buf);
                }
                buf.push(b'e');
            }
            Value::Dict(dict_value, _, _) => {
                // bencoded dict keys must appear in raw byte order
                let mut keys: Vec<&Vec<u8>> = dict_value.keys().collect();
                keys.sort();
                buf.push(b'd');
                for k in keys {
                    encode_byte_string(k, buf);
                    dict_value[k].encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }

    // source is the source data, index is where to look from,
    // returns the value and the index of the next byte to read
    fn from_bytes(source: &[u8], index: usize) -> (Self, usize) {
        match source.get(index) {
            // str
            Some(b'0'..=b'9') => {
                let mut index = index;
                let start_len_index = index;
                let end_len_index;
                loop {
                    match source.get(index) {
                        Some(b'0'..=b'9') => index += 1,
                        Some(b':') => {
                            end_len_index = index;
                            index += 1;
                            break;
                        }
                        _ => return (Value::Error(index), index),
                    }
                }
                let len_str = match std::str::from_utf8(&source[start_len_index..end_len_index]) {
                    Ok(s) => s,
                    Err(_) => return (Value::Error(start_len_index), index),
                };
                let string_len = match len_str.parse::<usize>() {
                    Ok(len) => len,
                    Err(_) => return (Value::Error(start_len_index), index),
                };
                let end_string_index = index + string_len;
                if end_string_index > source.len() {
                    return (Value::Error(start_len_index), index);
                }
                (
                    Value::Str(source[index..end_string_index].to_vec()),
                    end_string_index,
                )
            }

            // int
            Some(b'i') => {
                let mut index = index + 1;
                let start_int_index = index;
                let end_int_index;
                loop {
                    match source.get(index) {
                        Some(b'0'..=b'9' | b'-') => index += 1,
                        Some(b'e') => {
                            end_int_index = index;
                            index += 1;
                            break;
                        }
                        _ => return (Value::Error(index), index),
                    }
                }
                let int_str = match std::str::from_utf8(&source[start_int_index..end_int_index]) {
                    Ok(s) => s,
                    Err(_) => return (Value::Error(start_int_index), index),
                };
                if int_str == "-0" || (int_str.starts_with('0') && int_str.len() > 1) {
                    return (Value::Error(start_int_index), end_int_index);
                }
                match int_str.parse::<i64>() {
                    Ok(int_val) => (Value::Int(int_val), end_int_index + 1),
                    Err(_) => (Value::Error(start_int_index), index),
                }
            }

            // list
            Some(b'l') => {
                let mut l = Vec::new();
                let mut index = index + 1;
                loop {
                    match source.get(index) {
                        None => return (Value::Error(index), index),
                        Some(b'e') => {
                            index += 1;
                            break;
                        }
                        _ => {
                            let (v, new_index) = Self::from_bytes(source, index);
                            if let Value::Error(index_of_error) = v {
                                return (Value::Error(index_of_error), index);
                            }
                            index = new_index;
                            l.push(v);
                        }
                    }
                }
                (Value::List(l), index)
            }

            // dict
            Some(b'd') => {
                let dict_start = index;
                let mut d = HashMap::new();
                let mut index = index + 1;
                loop {
                    match source.get(index) {
                        None => return (Value::Error(index), index),
                        Some(b'e') => {
                            index += 1;
                            break;
                        }
                        _ => {
                            let (k, new_index) = Self::from_bytes(source, index);
                            let k = match k {
                                Value::Str(k) => k,
                                _ => return (Value::Error(index), index),
                            };
                            index = new_index;
                            let (v, new_index) = Self::from_bytes(source, index);
                            if let Value::Error(index_of_error) = v {
                                return (Value::Error(index_of_error), index);
                            }
                            index = new_index;
                            d.insert(k, v);
                        }
                    }
                }
                (Value::Dict(d, dict_start, index), index)
            }

            _ => (Value::Error(index), index),
        }
    }
}

fn encode_byte_string(s: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(format!("{}:", s.len()).as_bytes());
    buf.extend_from_slice(s);
}
