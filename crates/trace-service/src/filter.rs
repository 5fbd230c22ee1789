//! Output-side trace filter: a field allowlist plus optional string
//! redaction, applied to every packet when a session's buffers are read
//! back. Packets are walked as a flat sequence of protobuf
//! tag-length-delimited fields — this is enough to retain/drop whole
//! top-level fields and redact length-delimited (string/bytes) values, and
//! does not need to understand a message's full schema.

use trace_types::varint::{read_varint, write_varint};

/// Replaces every occurrence of `pattern` in a matched string field with a
/// single `replacement` character, rather than dropping the field
/// entirely — mirrors the original's `atrace_apps`/last-4-digits-style
/// partial redaction rather than wholesale removal.
#[derive(Debug, Clone)]
pub struct StringRedactionRule {
    pub field_number: u64,
    pub pattern: String,
    pub replacement: char,
}

/// The compiled shape of a `TraceConfig::TraceFilter`: which top-level
/// field numbers survive, and which of those get string redaction.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    /// Field numbers retained at the top level. Empty means "allow
    /// everything" — only `string_redactions` apply, if any.
    pub allowed_field_numbers: Vec<u64>,
    pub string_redactions: Vec<StringRedactionRule>,
}

impl TraceFilter {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.allowed_field_numbers.is_empty() && self.string_redactions.is_empty()
    }

    /// Applies the allowlist and redaction rules to one serialized packet.
    /// Truncated or malformed input is passed through as far as it parses
    /// and then stops — untrusted producer data must never panic the
    /// service, and a partially-filtered prefix is safer than none.
    #[must_use]
    pub fn apply(&self, packet: &[u8]) -> Vec<u8> {
        if self.is_noop() {
            return packet.to_vec();
        }
        let mut out = Vec::with_capacity(packet.len());
        let mut offset = 0;
        while offset < packet.len() {
            let Some((tag, tag_len)) = read_varint(&packet[offset..]) else { break };
            let field_number = tag >> 3;
            let wire_type = tag & 0x7;
            let value_offset = offset + tag_len;

            let value_len = match wire_type {
                0 => match read_varint(&packet[value_offset..]) {
                    Some((_, n)) => n,
                    None => break,
                },
                1 => 8,
                5 => 4,
                2 => match read_varint(&packet[value_offset..]) {
                    Some((len, n)) => n + len as usize,
                    None => break,
                },
                _ => break, // unknown wire type: cannot safely skip past it
            };
            if value_offset + value_len > packet.len() {
                break;
            }
            let field_end = value_offset + value_len;

            let retained = self.allowed_field_numbers.is_empty() || self.allowed_field_numbers.contains(&field_number);
            if retained {
                out.extend_from_slice(&write_varint(tag));
                if wire_type == 2 {
                    // Re-derive the length-delimited value (already
                    // validated above) to apply redaction before
                    // re-emitting its own length prefix.
                    let (len, len_n) = read_varint(&packet[value_offset..]).expect("validated above");
                    let value_start = value_offset + len_n;
                    let value = &packet[value_start..value_start + len as usize];
                    let redacted = self.redact_if_matched(field_number, value);
                    out.extend_from_slice(&write_varint(redacted.len() as u64));
                    out.extend_from_slice(&redacted);
                } else {
                    out.extend_from_slice(&packet[value_offset..field_end]);
                }
            }
            offset = field_end;
        }
        out
    }

    fn redact_if_matched(&self, field_number: u64, value: &[u8]) -> Vec<u8> {
        let Some(rule) = self.string_redactions.iter().find(|r| r.field_number == field_number) else {
            return value.to_vec();
        };
        if rule.pattern.is_empty() {
            return value.to_vec();
        }
        let Ok(text) = std::str::from_utf8(value) else { return value.to_vec() };
        text.replace(rule.pattern.as_str(), &rule.replacement.to_string()).into_bytes()
    }
}

/// Re-frames a stitched fragment stream (still length-prefixed per this
/// workspace's own fixed-4 convention) by applying `filter` to each
/// complete packet and emitting a fresh length prefix for the result,
/// since filtering can shrink a packet's byte length.
#[must_use]
pub fn filter_stream(stream: &[u8], filter: &TraceFilter) -> Vec<u8> {
    if filter.is_noop() {
        return stream.to_vec();
    }
    let mut out = Vec::with_capacity(stream.len());
    let mut offset = 0;
    while offset + 4 <= stream.len() {
        let len = trace_types::varint::decode_varint(&stream[offset..offset + 4]) as usize;
        offset += 4;
        if offset + len > stream.len() {
            break;
        }
        let packet = &stream[offset..offset + len];
        offset += len;
        let filtered = filter.apply(packet);
        out.extend_from_slice(&trace_types::varint::encode_varint_fixed4(filtered.len() as u32));
        out.extend_from_slice(&filtered);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(tag: u64, value: &[u8]) -> Vec<u8> {
        let mut out = write_varint(tag);
        out.extend_from_slice(&write_varint(value.len() as u64));
        out.extend_from_slice(value);
        out
    }

    #[test]
    fn noop_filter_passes_bytes_through_unchanged() {
        let filter = TraceFilter::default();
        let packet = field(1 << 3 | 2, b"hello");
        assert_eq!(filter.apply(&packet), packet);
    }

    #[test]
    fn disallowed_field_is_dropped() {
        let filter = TraceFilter { allowed_field_numbers: vec![1], string_redactions: vec![] };
        let mut packet = field(1 << 3 | 2, b"keep");
        packet.extend(field(2 << 3 | 2, b"drop"));
        let filtered = filter.apply(&packet);
        assert_eq!(filtered, field(1 << 3 | 2, b"keep"));
    }

    #[test]
    fn string_field_is_redacted_in_place() {
        let filter = TraceFilter {
            allowed_field_numbers: vec![],
            string_redactions: vec![StringRedactionRule { field_number: 3, pattern: "secret".into(), replacement: '*' }],
        };
        let packet = field(3 << 3 | 2, b"my secret token");
        let filtered = filter.apply(&packet);
        let expected = field(3 << 3 | 2, b"my * token");
        assert_eq!(filtered, expected);
    }

    #[test]
    fn filter_stream_reframes_shrunk_packets_with_fresh_length_prefixes() {
        let filter = TraceFilter { allowed_field_numbers: vec![1], string_redactions: vec![] };
        let packet_a = field(1 << 3 | 2, b"a");
        let mut packet_b = field(1 << 3 | 2, b"b");
        packet_b.extend(field(9 << 3 | 2, b"dropped-field-makes-this-longer"));

        let mut stream = Vec::new();
        for p in [&packet_a, &packet_b] {
            stream.extend_from_slice(&trace_types::varint::encode_varint_fixed4(p.len() as u32));
            stream.extend_from_slice(p);
        }

        let filtered_stream = filter_stream(&stream, &filter);
        let mut offset = 0;
        let mut packets = Vec::new();
        while offset + 4 <= filtered_stream.len() {
            let len = trace_types::varint::decode_varint(&filtered_stream[offset..offset + 4]) as usize;
            offset += 4;
            packets.push(filtered_stream[offset..offset + len].to_vec());
            offset += len;
        }
        assert_eq!(packets, vec![field(1 << 3 | 2, b"a"), field(1 << 3 | 2, b"b")]);
    }
}
