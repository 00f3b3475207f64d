use super::*;
use std::collections::BTreeMap;

fn dict<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(key, value)| (key.as_bytes().to_vec(), value))
            .collect::<BTreeMap<_, _>>(),
    )
}

#[test]
fn positive_encode_sorts_keys() {
    let inner = dict([
        ("A", Value::from(1)),
        ("C", Value::from(2)),
        ("B", Value::from(3)),
    ]);
    let value = dict([
        ("a", inner),
        ("b", Value::from(2)),
        ("z", Value::from(3)),
        ("c", Value::List(vec![])),
    ]);

    let encoded = encode(&value);

    assert_eq!(encoded, b"d1:ad1:Ai1e1:Bi3e1:Ci2ee1:bi2e1:cle1:zi3ee");
    assert_eq!(decode(&encoded, MAX_DEPTH_LOCAL).unwrap(), value);
}

#[test]
fn positive_decode_scalars() {
    assert_eq!(decode(b"i0e", 1).unwrap(), Value::Integer(0));
    assert_eq!(decode(b"i-42e", 1).unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"0:", 1).unwrap(), Value::Bytes(vec![]));
    assert_eq!(decode(b"4:spam", 1).unwrap(), Value::from("spam"));
}

#[test]
fn positive_decode_accepts_unsorted_keys() {
    let value = decode(b"d1:bi1e1:ai2ee", 1).unwrap();

    assert_eq!(value.get(b"a"), Some(&Value::Integer(2)));
    assert_eq!(value.get(b"b"), Some(&Value::Integer(1)));
    assert_eq!(encode(&value), b"d1:ai2e1:bi1ee");
}

#[test]
fn positive_decode_at_depth_limit() {
    assert!(decode(b"lllleeee", MAX_DEPTH_UNTRUSTED).is_ok());
    assert!(decode(b"d1:ad1:ad1:ad1:ai1eeeee", MAX_DEPTH_UNTRUSTED).is_ok());
}

#[test]
fn positive_scalars_need_no_depth() {
    assert_eq!(decode(b"i7e", 0).unwrap(), Value::Integer(7));
}

#[test]
fn negative_depth_exceeded() {
    assert_eq!(
        decode(b"lllll", MAX_DEPTH_UNTRUSTED),
        Err(DecodeError::RecursionDepth(MAX_DEPTH_UNTRUSTED))
    );
    assert_eq!(
        decode(b"ddddd", MAX_DEPTH_UNTRUSTED),
        Err(DecodeError::RecursionDepth(MAX_DEPTH_UNTRUSTED))
    );
    assert_eq!(
        decode(b"llllleeeee", MAX_DEPTH_UNTRUSTED),
        Err(DecodeError::RecursionDepth(MAX_DEPTH_UNTRUSTED))
    );
}

#[test]
fn negative_empty_input() {
    assert_eq!(decode(b"", MAX_DEPTH_LOCAL), Err(DecodeError::Empty));
}

#[test]
fn negative_trailing_bytes() {
    assert_eq!(
        decode(b"i1ei2e", MAX_DEPTH_LOCAL),
        Err(DecodeError::TrailingBytes(3))
    );
}

#[test]
fn negative_non_canonical_integers() {
    for input in [&b"i-0e"[..], b"i03e", b"i-03e", b"ie", b"i-e", b"i1x2e", b"i+1e"] {
        assert!(
            matches!(
                decode(input, MAX_DEPTH_LOCAL),
                Err(DecodeError::InvalidInteger(0))
            ),
            "{:?}",
            String::from_utf8_lossy(input)
        );
    }
}

#[test]
fn negative_integer_overflow() {
    assert!(matches!(
        decode(b"i99999999999999999999e", MAX_DEPTH_LOCAL),
        Err(DecodeError::InvalidInteger(_))
    ));
}

#[test]
fn negative_malformed_length_prefix() {
    assert_eq!(
        decode(b"04:spam", MAX_DEPTH_LOCAL),
        Err(DecodeError::InvalidLength(0))
    );
    assert_eq!(
        decode(b"4x:spam", MAX_DEPTH_LOCAL),
        Err(DecodeError::InvalidLength(0))
    );
    assert_eq!(
        decode(b"5:spam", MAX_DEPTH_LOCAL),
        Err(DecodeError::UnexpectedEof)
    );
}

#[test]
fn negative_bad_dict_keys() {
    assert_eq!(
        decode(b"di1ei2ee", MAX_DEPTH_LOCAL),
        Err(DecodeError::NonStringKey(1))
    );
    assert_eq!(
        decode(b"d1:ai1e1:ai2ee", MAX_DEPTH_LOCAL),
        Err(DecodeError::DuplicateKey(7))
    );
}

#[test]
fn negative_unterminated_containers() {
    assert_eq!(
        decode(b"li1e", MAX_DEPTH_LOCAL),
        Err(DecodeError::UnexpectedEof)
    );
    assert_eq!(
        decode(b"d1:a", MAX_DEPTH_LOCAL),
        Err(DecodeError::UnexpectedEof)
    );
}

#[test]
fn negative_unknown_type_byte() {
    assert_eq!(
        decode(b"x", MAX_DEPTH_LOCAL),
        Err(DecodeError::UnexpectedByte {
            byte: b'x',
            offset: 0
        })
    );
}
