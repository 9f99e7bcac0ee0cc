// Copyright 2020 Joyent, Inc.

//! Primary key <-> object id encoding, and shard-tagged key generation.
//!
//! Scalar keys encode as their canonical text. Composite keys encode their
//! fields in declaration order joined with `,`, with no escaping: a field
//! value containing `,` cannot be decoded again.
//!
//! A sharded key is a random base key followed by one tag character from the
//! 64-symbol alphabet `a-z A-Z 0-9 - _`. The tag is a rolling hash of the base
//! key in wrapping 32-bit arithmetic, so any node can recompute it. It is not
//! tamper-proof.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::config::Config;
use crate::error::Error;

pub const KEY_SEPARATOR: char = ',';

pub const SHARD_ALPHABET: &[u8; 64] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

const SHARD_HASH_SEED: i32 = 137;
const SHARD_HASH_PRIME: i32 = 65521;
// Reserved; must stay 0 for keys minted by existing deployments.
const SHARD_OFFSET: i32 = 0;

pub const MIN_KEY_LENGTH: usize = 8;

/// Byte -> alphabet class. Alphabet bytes map to 0..63; every other byte gets
/// the next value from 64 upward, in byte order.
const CLASS_INDEX: [i32; 256] = build_class_index();

const fn build_class_index() -> [i32; 256] {
    let mut table = [-1i32; 256];
    let mut i = 0;
    while i < SHARD_ALPHABET.len() {
        table[SHARD_ALPHABET[i] as usize] = i as i32;
        i += 1;
    }
    let mut next = 64;
    let mut b = 0;
    while b < 256 {
        if table[b] < 0 {
            table[b] = next;
            next += 1;
        }
        b += 1;
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    String,
    Int,
    Long,
    Float,
    Double,
    Char,
}

impl ScalarType {
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
            ScalarType::Char => "char",
        }
    }

    fn parse_value(self, text: &str) -> Result<KeyValue, Error> {
        let bad = |e: &dyn fmt::Display| {
            Error::decode(text, format!("not a valid {}: {}", self.name(), e))
        };
        match self {
            ScalarType::String => Ok(KeyValue::String(String::from(text))),
            ScalarType::Int => {
                text.parse().map(KeyValue::Int).map_err(|e| bad(&e))
            }
            ScalarType::Long => {
                text.parse().map(KeyValue::Long).map_err(|e| bad(&e))
            }
            ScalarType::Float => {
                text.parse().map(KeyValue::Float).map_err(|e| bad(&e))
            }
            ScalarType::Double => {
                text.parse().map(KeyValue::Double).map_err(|e| bad(&e))
            }
            ScalarType::Char => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(KeyValue::Char(c)),
                    _ => Err(bad(&"expected exactly one character")),
                }
            }
        }
    }
}

impl FromStr for ScalarType {
    type Err = Error;

    /// Primitive and boxed spellings are accepted identically.
    fn from_str(s: &str) -> Result<ScalarType, Error> {
        match s {
            "string" | "String" => Ok(ScalarType::String),
            "int" | "Integer" => Ok(ScalarType::Int),
            "long" | "Long" => Ok(ScalarType::Long),
            "float" | "Float" => Ok(ScalarType::Float),
            "double" | "Double" => Ok(ScalarType::Double),
            "char" | "Character" => Ok(ScalarType::Char),
            _ => Err(Error::Config(format!(
                "unsupported primary key type '{}'",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    String(String),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
}

impl KeyValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            KeyValue::String(_) => ScalarType::String,
            KeyValue::Int(_) => ScalarType::Int,
            KeyValue::Long(_) => ScalarType::Long,
            KeyValue::Float(_) => ScalarType::Float,
            KeyValue::Double(_) => ScalarType::Double,
            KeyValue::Char(_) => ScalarType::Char,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::String(v) => write!(f, "{}", v),
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Long(v) => write!(f, "{}", v),
            KeyValue::Float(v) => write!(f, "{}", v),
            KeyValue::Double(v) => write!(f, "{}", v),
            KeyValue::Char(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryKey {
    Scalar(KeyValue),
    /// Named field values. Order does not matter for encoding; the shape's
    /// declaration order does.
    Composite(Vec<(String, KeyValue)>),
}

impl PrimaryKey {
    pub fn field(&self, name: &str) -> Option<&KeyValue> {
        match self {
            PrimaryKey::Scalar(_) => None,
            PrimaryKey::Composite(fields) => fields
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, value)| value),
        }
    }
}

impl From<KeyValue> for PrimaryKey {
    fn from(value: KeyValue) -> PrimaryKey {
        PrimaryKey::Scalar(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    pub name: String,
    pub ty: ScalarType,
}

impl KeyField {
    pub fn new<N: Into<String>>(name: N, ty: ScalarType) -> KeyField {
        KeyField {
            name: name.into(),
            ty,
        }
    }
}

/// The declared shape of an endpoint's primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyShape {
    Scalar(ScalarType),
    Composite(Vec<KeyField>),
}

/// Textual form used by the `primary-key-class` attribute: a scalar type
/// name, or `{name:type,...}` for a composite key.
impl fmt::Display for KeyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyShape::Scalar(ty) => write!(f, "{}", ty.name()),
            KeyShape::Composite(fields) => {
                let fields: Vec<String> = fields
                    .iter()
                    .map(|field| format!("{}:{}", field.name, field.ty.name()))
                    .collect();
                write!(f, "{{{}}}", fields.join(","))
            }
        }
    }
}

impl FromStr for KeyShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<KeyShape, Error> {
        let s = s.trim();
        if !s.starts_with('{') {
            return s.parse().map(KeyShape::Scalar);
        }
        let body = s
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| {
                Error::Config(format!("malformed primary key shape '{}'", s))
            })?;
        let mut fields = Vec::new();
        for decl in body.split(',').filter(|decl| !decl.trim().is_empty()) {
            let (name, ty) = decl.split_once(':').ok_or_else(|| {
                Error::Config(format!("malformed key field '{}'", decl))
            })?;
            fields.push(KeyField::new(name.trim(), ty.trim().parse()?));
        }
        if fields.is_empty() {
            return Err(Error::Config(String::from(
                "composite primary key declares no fields",
            )));
        }
        Ok(KeyShape::Composite(fields))
    }
}

/// Converts between typed primary keys and wire-safe object ids.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityCodec {
    shape: KeyShape,
}

impl IdentityCodec {
    pub fn new(shape: KeyShape) -> IdentityCodec {
        IdentityCodec { shape }
    }

    pub fn shape(&self) -> &KeyShape {
        &self.shape
    }

    pub fn encode_key(&self, key: &PrimaryKey) -> Result<String, Error> {
        match (&self.shape, key) {
            (KeyShape::Scalar(ty), PrimaryKey::Scalar(value)) => {
                check_type(*ty, value, "key")?;
                Ok(value.to_string())
            }
            (KeyShape::Composite(fields), PrimaryKey::Composite(_)) => {
                let mut parts = Vec::with_capacity(fields.len());
                for field in fields {
                    let value = key.field(&field.name).ok_or_else(|| {
                        Error::Config(format!(
                            "primary key is missing field '{}'",
                            field.name
                        ))
                    })?;
                    check_type(field.ty, value, &field.name)?;
                    parts.push(value.to_string());
                }
                Ok(parts.join(","))
            }
            _ => Err(Error::Config(format!(
                "primary key does not match declared shape {}",
                self.shape
            ))),
        }
    }

    pub fn decode_key(&self, object_id: &str) -> Result<PrimaryKey, Error> {
        match &self.shape {
            KeyShape::Scalar(ty) => {
                ty.parse_value(object_id).map(PrimaryKey::Scalar)
            }
            KeyShape::Composite(fields) => {
                let segments: Vec<&str> =
                    object_id.split(KEY_SEPARATOR).collect();
                if segments.len() != fields.len() {
                    return Err(Error::decode(
                        object_id,
                        format!(
                            "expected {} fields, found {}",
                            fields.len(),
                            segments.len()
                        ),
                    ));
                }
                let mut values = Vec::with_capacity(fields.len());
                for (field, segment) in fields.iter().zip(segments) {
                    let value = field.ty.parse_value(segment).map_err(|e| {
                        Error::decode(
                            object_id,
                            format!("field '{}': {}", field.name, e),
                        )
                    })?;
                    values.push((field.name.clone(), value));
                }
                Ok(PrimaryKey::Composite(values))
            }
        }
    }
}

fn check_type(ty: ScalarType, value: &KeyValue, what: &str) -> Result<(), Error> {
    if value.scalar_type() == ty {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{} is a {}, declared as {}",
            what,
            value.scalar_type().name(),
            ty.name()
        )))
    }
}

/// Source of random base keys for [`generate_sharded_key`].
pub trait UniqueIdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Draws keys uniformly from the shard alphabet.
#[derive(Debug, Clone)]
pub struct RandomIdGenerator {
    length: usize,
}

impl RandomIdGenerator {
    pub fn new(length: usize) -> RandomIdGenerator {
        RandomIdGenerator {
            length: length.max(MIN_KEY_LENGTH),
        }
    }

    pub fn from_config(config: &Config) -> RandomIdGenerator {
        RandomIdGenerator::new(config.key_length)
    }
}

impl Default for RandomIdGenerator {
    fn default() -> RandomIdGenerator {
        RandomIdGenerator::new(crate::config::DEFAULT_KEY_LENGTH)
    }
}

impl UniqueIdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| SHARD_ALPHABET[rng.gen_range(0, SHARD_ALPHABET.len())] as char)
            .collect()
    }
}

/// Alphabet index of the tag for `body`.
pub fn shard_index(body: &[u8]) -> usize {
    let mut hash = SHARD_HASH_SEED;
    for &b in body {
        hash = SHARD_HASH_PRIME
            .wrapping_mul(hash)
            .wrapping_add(CLASS_INDEX[b as usize]);
    }
    let tail = hash.wrapping_mul(SHARD_HASH_PRIME);

    (64i32.wrapping_add(SHARD_OFFSET).wrapping_sub(tail) & 0x3f) as usize
}

pub fn shard_tag(body: &str) -> char {
    SHARD_ALPHABET[shard_index(body.as_bytes())] as char
}

pub fn generate_sharded_key(ids: &dyn UniqueIdGenerator) -> String {
    let mut key = ids.generate();
    let tag = shard_tag(&key);
    key.push(tag);
    key
}

/// True when the last character of `key` is the tag of everything before it.
pub fn verify_sharded_key(key: &str) -> bool {
    match key.char_indices().last() {
        Some((idx, tag)) if idx > 0 => shard_tag(&key[..idx]) == tag,
        _ => false,
    }
}

/// The bucket a verified sharded key belongs to.
pub fn shard_of(key: &str) -> Option<usize> {
    if !verify_sharded_key(key) {
        return None;
    }
    let tag = *key.as_bytes().last()?;
    SHARD_ALPHABET.iter().position(|&c| c == tag)
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, TestResult};

    fn composite() -> IdentityCodec {
        IdentityCodec::new(KeyShape::Composite(vec![
            KeyField::new("id", ScalarType::Int),
            KeyField::new("name", ScalarType::String),
        ]))
    }

    fn scalar_round_trip(ty: ScalarType, value: KeyValue) -> bool {
        let codec = IdentityCodec::new(KeyShape::Scalar(ty));
        let key = PrimaryKey::Scalar(value);
        match codec.encode_key(&key) {
            Ok(text) => codec.decode_key(&text).ok() == Some(key),
            Err(_) => false,
        }
    }

    quickcheck! {
        fn prop_string_round_trip(v: String) -> bool {
            scalar_round_trip(ScalarType::String, KeyValue::String(v))
        }

        fn prop_int_round_trip(v: i32) -> bool {
            scalar_round_trip(ScalarType::Int, KeyValue::Int(v))
        }

        fn prop_long_round_trip(v: i64) -> bool {
            scalar_round_trip(ScalarType::Long, KeyValue::Long(v))
        }

        fn prop_float_round_trip(v: f32) -> TestResult {
            if !v.is_finite() {
                return TestResult::discard();
            }
            TestResult::from_bool(scalar_round_trip(ScalarType::Float, KeyValue::Float(v)))
        }

        fn prop_double_round_trip(v: f64) -> TestResult {
            if !v.is_finite() {
                return TestResult::discard();
            }
            TestResult::from_bool(scalar_round_trip(ScalarType::Double, KeyValue::Double(v)))
        }

        fn prop_char_round_trip(v: char) -> bool {
            scalar_round_trip(ScalarType::Char, KeyValue::Char(v))
        }

        fn prop_composite_round_trip(id: i32, name: String) -> TestResult {
            if name.contains(KEY_SEPARATOR) {
                return TestResult::discard();
            }
            let codec = composite();
            let key = PrimaryKey::Composite(vec![
                (String::from("id"), KeyValue::Int(id)),
                (String::from("name"), KeyValue::String(name)),
            ]);
            let text = match codec.encode_key(&key) {
                Ok(text) => text,
                Err(_) => return TestResult::failed(),
            };
            TestResult::from_bool(codec.decode_key(&text).ok() == Some(key))
        }

        fn prop_sharded_key_tag_is_reproducible(len: usize) -> bool {
            let key = generate_sharded_key(&RandomIdGenerator::new(len % 64));
            let (body, tag) = key.split_at(key.len() - 1);
            let idx = shard_index(body.as_bytes());

            SHARD_ALPHABET.contains(&tag.as_bytes()[0])
                && SHARD_ALPHABET[idx] == tag.as_bytes()[0]
                && verify_sharded_key(&key)
        }
    }

    #[test]
    fn composite_encodes_in_declaration_order() {
        let codec = composite();
        let key = PrimaryKey::Composite(vec![
            (String::from("name"), KeyValue::String(String::from("x"))),
            (String::from("id"), KeyValue::Int(7)),
        ]);

        assert_eq!(codec.encode_key(&key).unwrap(), "7,x");
        assert_eq!(
            codec.decode_key("7,x").unwrap(),
            PrimaryKey::Composite(vec![
                (String::from("id"), KeyValue::Int(7)),
                (String::from("name"), KeyValue::String(String::from("x"))),
            ])
        );
    }

    #[test]
    fn embedded_separator_breaks_round_trip() {
        let codec = composite();
        let key = PrimaryKey::Composite(vec![
            (String::from("id"), KeyValue::Int(7)),
            (String::from("name"), KeyValue::String(String::from("a,b"))),
        ]);
        let text = codec.encode_key(&key).unwrap();

        assert_eq!(text, "7,a,b");
        match codec.decode_key(&text) {
            Err(Error::Decode { .. }) => (),
            other => panic!("expected a decode error, got {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_bad_field_text() {
        let codec = composite();

        assert!(matches!(codec.decode_key("seven,x"), Err(Error::Decode { .. })));
        assert!(matches!(codec.decode_key("7"), Err(Error::Decode { .. })));
        let chars = IdentityCodec::new(KeyShape::Scalar(ScalarType::Char));
        assert!(matches!(chars.decode_key("ab"), Err(Error::Decode { .. })));
    }

    #[test]
    fn encode_rejects_mismatched_key() {
        let codec = IdentityCodec::new(KeyShape::Scalar(ScalarType::Long));

        assert!(matches!(
            codec.encode_key(&PrimaryKey::Scalar(KeyValue::Int(1))),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            composite().encode_key(&PrimaryKey::Composite(vec![(
                String::from("id"),
                KeyValue::Int(1)
            )])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn boxed_and_primitive_type_names_agree() {
        assert_eq!("int".parse::<ScalarType>().unwrap(), ScalarType::Int);
        assert_eq!("Integer".parse::<ScalarType>().unwrap(), ScalarType::Int);
        assert_eq!("Character".parse::<ScalarType>().unwrap(), ScalarType::Char);
        assert!(matches!("Date".parse::<ScalarType>(), Err(Error::Config(_))));
    }

    #[test]
    fn key_shape_text_form() {
        let shape = composite().shape().clone();

        assert_eq!(shape.to_string(), "{id:int,name:string}");
        assert_eq!("{id:int,name:string}".parse::<KeyShape>().unwrap(), shape);
        assert_eq!(
            "Long".parse::<KeyShape>().unwrap(),
            KeyShape::Scalar(ScalarType::Long)
        );
        assert!(matches!("{id:blob}".parse::<KeyShape>(), Err(Error::Config(_))));
    }

    #[test]
    fn class_table_covers_every_byte() {
        assert_eq!(CLASS_INDEX[b'a' as usize], 0);
        assert_eq!(CLASS_INDEX[b'Z' as usize], 51);
        assert_eq!(CLASS_INDEX[b'-' as usize], 62);
        assert_eq!(CLASS_INDEX[b'_' as usize], 63);
        assert_eq!(CLASS_INDEX[0], 64);
        let mut others: Vec<i32> = CLASS_INDEX.iter().cloned().filter(|&v| v >= 64).collect();
        others.sort();
        assert_eq!(others, (64..256).collect::<Vec<i32>>());
    }

    #[test]
    fn shard_tag_is_fixed_for_known_input() {
        // hash("") = 137, tail = 137 * 65521 = 8976377, (64 - tail) & 0x3f = 7
        assert_eq!(shard_index(b""), 7);
        assert_eq!(shard_tag(""), 'h');
        // "a": hash = 65521 * 137 + 0 = 8976377; tail wraps past i32::MAX.
        let tail = 8976377i32.wrapping_mul(65521);
        let expected = (64i32.wrapping_sub(tail) & 0x3f) as usize;
        assert_eq!(shard_index(b"a"), expected);
    }

    #[test]
    fn verify_detects_altered_tag() {
        let key = generate_sharded_key(&RandomIdGenerator::default());
        let (body, tag) = key.split_at(key.len() - 1);
        let other = if tag == "a" { 'b' } else { 'a' };
        let altered = format!("{}{}", body, other);

        assert!(verify_sharded_key(&key));
        assert!(!verify_sharded_key(&altered));
        assert!(!verify_sharded_key(""));
        assert_eq!(shard_of(&key), Some(shard_index(body.as_bytes())));
        assert_eq!(shard_of(&altered), None);
    }

    #[test]
    fn generated_keys_respect_minimum_length() {
        let key = generate_sharded_key(&RandomIdGenerator::new(2));

        assert_eq!(key.len(), MIN_KEY_LENGTH + 1);
    }
}
