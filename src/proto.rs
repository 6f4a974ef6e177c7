//! Wire format of one ingest datagram.
//!
//! Every UDP datagram (up to 64 KiB) carries exactly one protobuf-encoded
//! request record in the established Pinba schema. Strings appear once in
//! the record's embedded mini-dictionary; request tags and timer tags
//! reference it by offset. The flat `timer_tag_name`/`timer_tag_value`
//! arrays are addressed through `timer_tag_count` prefix sums.

use prost::Message;

/// A decoded request record, field-for-field the established wire schema.
#[derive(Clone, PartialEq, Message)]
pub struct WireRequest {
    #[prost(string, required, tag = "1")]
    pub hostname: String,
    #[prost(string, required, tag = "2")]
    pub server_name: String,
    #[prost(string, required, tag = "3")]
    pub script_name: String,
    #[prost(uint32, required, tag = "4")]
    pub request_count: u32,
    #[prost(uint32, required, tag = "5")]
    pub document_size: u32,
    #[prost(uint32, required, tag = "6")]
    pub memory_peak: u32,
    #[prost(float, required, tag = "7")]
    pub request_time: f32,
    #[prost(float, required, tag = "8")]
    pub ru_utime: f32,
    #[prost(float, required, tag = "9")]
    pub ru_stime: f32,
    #[prost(uint32, repeated, packed = "false", tag = "10")]
    pub timer_hit_count: Vec<u32>,
    #[prost(float, repeated, packed = "false", tag = "11")]
    pub timer_value: Vec<f32>,
    #[prost(uint32, repeated, packed = "false", tag = "12")]
    pub timer_tag_count: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "13")]
    pub timer_tag_name: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "14")]
    pub timer_tag_value: Vec<u32>,
    #[prost(string, repeated, tag = "15")]
    pub dictionary: Vec<String>,
    #[prost(uint32, optional, tag = "16")]
    pub status: Option<u32>,
    #[prost(uint32, optional, tag = "17")]
    pub memory_footprint: Option<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "18")]
    pub tag_name: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "19")]
    pub tag_value: Vec<u32>,
    #[prost(float, repeated, packed = "false", tag = "20")]
    pub timer_ru_utime: Vec<f32>,
    #[prost(float, repeated, packed = "false", tag = "21")]
    pub timer_ru_stime: Vec<f32>,
    #[prost(string, optional, tag = "22")]
    pub schema: Option<String>,
}

/// Decodes one datagram payload into a record.
///
/// # Errors
/// Returns the prost decode error for malformed payloads; the caller
/// counts and drops.
pub fn decode_request(buf: &[u8]) -> Result<WireRequest, prost::DecodeError> {
    WireRequest::decode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_minimal() {
        let r = WireRequest {
            hostname: "web01".to_string(),
            server_name: "example.com".to_string(),
            script_name: "/index.php".to_string(),
            request_count: 1,
            document_size: 1234,
            memory_peak: 4096,
            request_time: 0.015,
            ru_utime: 0.003,
            ru_stime: 0.001,
            status: Some(200),
            ..Default::default()
        };

        let mut buf = Vec::new();
        r.encode(&mut buf).expect("encode");
        let back = decode_request(&buf).expect("decode");
        assert_eq!(back, r);
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(decode_request(&[0xff, 0xff, 0xff, 0x01, 0x02]).is_err());
    }
}
